use chrono::{DateTime, Utc};
use heat_protocol::tariff::{Tariff, TariffPeriod};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One stored telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub power_watts: Option<i64>,
    pub battery_soc: Option<i64>,
    #[serde(default)]
    pub current_temp_f: Option<i64>,
    #[serde(default)]
    pub target_temp_f: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SavingsReport {
    pub total_kwh: f64,
    pub peak_kwh: f64,
    pub offpeak_kwh: f64,
    pub peak_shaved_kwh: f64,
    pub savings: f64,
    pub current_period: Option<TariffPeriod>,
    pub current_rate: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl SavingsReport {
    /// Cents-level precision for display.
    pub fn rounded(&self) -> SavingsReport {
        SavingsReport {
            total_kwh: round2(self.total_kwh),
            peak_kwh: round2(self.peak_kwh),
            offpeak_kwh: round2(self.offpeak_kwh),
            peak_shaved_kwh: round2(self.peak_shaved_kwh),
            savings: round2(self.savings),
            current_period: self.current_period,
            current_rate: self.current_rate,
        }
    }
}

/// Attributes energy to tariff periods and prices the battery energy that was
/// discharged during peak hours.
///
/// Heater wattage is informational only: the heater may run straight off the
/// battery even off-peak, so savings are derived from SOC drops that happen
/// while the tariff is peak or super-peak.
pub fn estimate(
    readings: &[Reading],
    poll_interval: Duration,
    battery_capacity_kwh: f64,
    tariff: &Tariff,
    now: DateTime<Utc>,
) -> SavingsReport {
    let hours_per_reading = poll_interval.as_secs_f64() / 3600.0;
    let mut peak_wh = 0.0;
    let mut offpeak_wh = 0.0;
    let mut peak_shaved_kwh = 0.0;
    let mut prev_soc: Option<i64> = None;

    for reading in readings {
        let period = tariff.period_at(reading.timestamp);

        if let Some(watts) = reading.power_watts.filter(|&w| w > 0) {
            let wh = watts as f64 * hours_per_reading;
            match period {
                TariffPeriod::OffPeak => offpeak_wh += wh,
                TariffPeriod::Peak | TariffPeriod::SuperPeak => peak_wh += wh,
            }
        }

        if let (Some(prev), Some(current)) = (prev_soc, reading.battery_soc) {
            let drop = prev - current;
            if drop > 0 && period.is_peak() {
                peak_shaved_kwh += (drop as f64 / 100.0) * battery_capacity_kwh;
            }
        }
        prev_soc = reading.battery_soc;
    }

    let rate_delta = tariff.peak_rate_at(now) - tariff.offpeak_rate_at(now);
    SavingsReport {
        total_kwh: (peak_wh + offpeak_wh) / 1000.0,
        peak_kwh: peak_wh / 1000.0,
        offpeak_kwh: offpeak_wh / 1000.0,
        peak_shaved_kwh,
        savings: peak_shaved_kwh * rate_delta,
        current_period: Some(tariff.period_at(now)),
        current_rate: tariff.rate_at(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(ts: DateTime<Utc>, watts: Option<i64>, soc: Option<i64>) -> Reading {
        Reading {
            timestamp: ts,
            power_watts: watts,
            battery_soc: soc,
            current_temp_f: None,
            target_temp_f: None,
        }
    }

    // 12:00 EST, winter peak.
    fn winter_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 17, 0, 0).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn soc_drop_during_peak_is_shaved_energy() {
        let start = winter_noon();
        let readings: Vec<Reading> = (0..=10)
            .map(|i| reading(start + chrono::Duration::minutes(i), Some(1500), Some(80 - i)))
            .collect();
        let tariff = Tariff::default();

        let report = estimate(&readings, Duration::from_secs(60), 3.6, &tariff, start);
        assert!(approx(report.peak_shaved_kwh, 0.36));
        let rate_delta = 0.1305 - 0.0249;
        assert!(approx(report.savings, 0.36 * rate_delta));
        assert_eq!(report.current_period, Some(TariffPeriod::Peak));

        let shown = report.rounded();
        assert_eq!(shown.peak_shaved_kwh, 0.36);
        assert_eq!(shown.savings, 0.04);
    }

    #[test]
    fn off_peak_discharge_does_not_count() {
        // 03:00 EST.
        let start = Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap();
        let readings = vec![
            reading(start, Some(1500), Some(80)),
            reading(start + chrono::Duration::minutes(1), Some(1500), Some(70)),
        ];
        let report = estimate(&readings, Duration::from_secs(60), 3.6, &Tariff::default(), start);
        assert_eq!(report.peak_shaved_kwh, 0.0);
        assert_eq!(report.savings, 0.0);
        assert!(approx(report.offpeak_kwh, 0.05));
        assert_eq!(report.rounded().offpeak_kwh, 0.05);
        assert_eq!(report.peak_kwh, 0.0);
    }

    #[test]
    fn charging_and_gaps_are_ignored() {
        let start = winter_noon();
        let readings = vec![
            reading(start, None, Some(50)),
            reading(start + chrono::Duration::minutes(1), None, Some(60)),
            reading(start + chrono::Duration::minutes(2), None, None),
            reading(start + chrono::Duration::minutes(3), None, Some(40)),
        ];
        let report = estimate(&readings, Duration::from_secs(60), 3.6, &Tariff::default(), start);
        assert_eq!(report.peak_shaved_kwh, 0.0);
    }

    #[test]
    fn energy_totals_split_by_period() {
        let peak = winter_noon();
        let off_peak = Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap();
        let readings = vec![
            reading(off_peak, Some(1000), None),
            reading(peak, Some(2000), None),
            reading(peak, Some(0), None),
            reading(peak, Some(-50), None),
        ];
        let report = estimate(&readings, Duration::from_secs(3600), 3.6, &Tariff::default(), peak);
        assert!(approx(report.offpeak_kwh, 1.0));
        assert!(approx(report.peak_kwh, 2.0));
        assert!(approx(report.total_kwh, 3.0));
    }

    #[test]
    fn empty_history_reports_zero() {
        let report = estimate(&[], Duration::from_secs(1), 3.6, &Tariff::default(), winter_noon());
        assert_eq!(report.total_kwh, 0.0);
        assert_eq!(report.savings, 0.0);
        assert_eq!(report.current_rate, 0.1305);
    }
}
