//! Time-of-use tariff: season, period and $/kWh for a wall-clock instant.
//!
//! Every function here is evaluated against the civil time of the installation,
//! so callers convert through [`Tariff::local`] (or pass an already-local
//! `DateTime`). Nothing is cached; a call always reflects the period of the
//! instant it is given.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

const SUMMER_FIRST_MONTH: u32 = 6;
const SUMMER_LAST_MONTH: u32 = 9;
const OFF_PEAK_END_HOUR: u32 = 8;
const SUPER_PEAK_START_HOUR: u32 = 14;
const SUPER_PEAK_END_HOUR: u32 = 18;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::New_York;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Summer,
    Winter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TariffPeriod {
    OffPeak,
    Peak,
    SuperPeak,
}

impl TariffPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TariffPeriod::OffPeak => "off_peak",
            TariffPeriod::Peak => "peak",
            TariffPeriod::SuperPeak => "super_peak",
        }
    }

    /// Peak and super-peak both count as expensive hours.
    pub fn is_peak(&self) -> bool {
        !matches!(self, TariffPeriod::OffPeak)
    }
}

impl fmt::Display for TariffPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn season<T: TimeZone>(t: &DateTime<T>) -> Season {
    if (SUMMER_FIRST_MONTH..=SUMMER_LAST_MONTH).contains(&t.month()) {
        Season::Summer
    } else {
        Season::Winter
    }
}

pub fn is_weekday<T: TimeZone>(t: &DateTime<T>) -> bool {
    !matches!(t.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn period<T: TimeZone>(t: &DateTime<T>) -> TariffPeriod {
    let hour = t.hour();
    if season(t) == Season::Summer
        && is_weekday(t)
        && (SUPER_PEAK_START_HOUR..SUPER_PEAK_END_HOUR).contains(&hour)
    {
        TariffPeriod::SuperPeak
    } else if hour < OFF_PEAK_END_HOUR {
        TariffPeriod::OffPeak
    } else {
        TariffPeriod::Peak
    }
}

/// $/kWh per period and season.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateTable {
    pub offpeak: f64,
    pub summer_peak: f64,
    pub winter_peak: f64,
    pub super_peak: f64,
}

impl Default for RateTable {
    fn default() -> Self {
        RateTable {
            offpeak: 0.0249,
            summer_peak: 0.3523,
            winter_peak: 0.1305,
            super_peak: 0.3523,
        }
    }
}

impl RateTable {
    pub fn rate_for(&self, period: TariffPeriod, season: Season) -> f64 {
        match period {
            TariffPeriod::OffPeak => self.offpeak,
            TariffPeriod::SuperPeak => self.super_peak,
            TariffPeriod::Peak => match season {
                Season::Summer => self.summer_peak,
                Season::Winter => self.winter_peak,
            },
        }
    }

    pub fn rate<T: TimeZone>(&self, t: &DateTime<T>) -> f64 {
        self.rate_for(period(t), season(t))
    }

    /// Ordinary peak rate for the season of `t`, regardless of the hour.
    pub fn peak_rate<T: TimeZone>(&self, t: &DateTime<T>) -> f64 {
        self.rate_for(TariffPeriod::Peak, season(t))
    }

    pub fn offpeak_rate<T: TimeZone>(&self, t: &DateTime<T>) -> f64 {
        self.rate_for(TariffPeriod::OffPeak, season(t))
    }
}

/// Rate table bound to the installation's time zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tariff {
    pub rates: RateTable,
    pub tz: Tz,
}

impl Default for Tariff {
    fn default() -> Self {
        Tariff::new(RateTable::default(), DEFAULT_TIMEZONE)
    }
}

impl Tariff {
    pub fn new(rates: RateTable, tz: Tz) -> Tariff {
        Tariff { rates, tz }
    }

    pub fn local(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        now.with_timezone(&self.tz)
    }

    pub fn period_at(&self, now: DateTime<Utc>) -> TariffPeriod {
        period(&self.local(now))
    }

    pub fn rate_at(&self, now: DateTime<Utc>) -> f64 {
        self.rates.rate(&self.local(now))
    }

    pub fn peak_rate_at(&self, now: DateTime<Utc>) -> f64 {
        self.rates.peak_rate(&self.local(now))
    }

    pub fn offpeak_rate_at(&self, now: DateTime<Utc>) -> f64 {
        self.rates.offpeak_rate(&self.local(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        New_York.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn early_morning_is_off_peak() {
        let t = local(2024, 1, 10, 3, 0);
        assert_eq!(period(&t), TariffPeriod::OffPeak);
        assert_eq!(RateTable::default().rate(&t), 0.0249);

        let summer = local(2024, 7, 17, 3, 0);
        assert_eq!(period(&summer), TariffPeriod::OffPeak);
        assert_eq!(RateTable::default().rate(&summer), 0.0249);
    }

    #[test]
    fn off_peak_window_ends_at_eight() {
        assert_eq!(period(&local(2024, 1, 10, 0, 0)), TariffPeriod::OffPeak);
        assert_eq!(period(&local(2024, 1, 10, 7, 59)), TariffPeriod::OffPeak);
        assert_eq!(period(&local(2024, 1, 10, 8, 0)), TariffPeriod::Peak);
        assert_eq!(period(&local(2024, 1, 10, 23, 59)), TariffPeriod::Peak);
    }

    #[test]
    fn summer_weekday_afternoon_is_super_peak() {
        // 2024-07-17 is a Wednesday.
        let wednesday = local(2024, 7, 17, 15, 0);
        assert!(is_weekday(&wednesday));
        assert_eq!(period(&wednesday), TariffPeriod::SuperPeak);
        assert_eq!(RateTable::default().rate(&wednesday), 0.3523);

        assert_eq!(period(&local(2024, 7, 17, 13, 59)), TariffPeriod::Peak);
        assert_eq!(period(&local(2024, 7, 17, 14, 0)), TariffPeriod::SuperPeak);
        assert_eq!(period(&local(2024, 7, 17, 18, 0)), TariffPeriod::Peak);
    }

    #[test]
    fn weekend_is_never_super_peak() {
        let saturday = local(2024, 7, 20, 15, 0);
        assert!(!is_weekday(&saturday));
        assert_eq!(period(&saturday), TariffPeriod::Peak);
    }

    #[test]
    fn winter_afternoon_is_plain_peak() {
        let t = local(2024, 1, 10, 15, 0);
        assert_eq!(season(&t), Season::Winter);
        assert_eq!(period(&t), TariffPeriod::Peak);
        assert_eq!(RateTable::default().rate(&t), 0.1305);
    }

    #[test]
    fn season_boundaries() {
        assert_eq!(season(&local(2024, 5, 31, 12, 0)), Season::Winter);
        assert_eq!(season(&local(2024, 6, 1, 12, 0)), Season::Summer);
        assert_eq!(season(&local(2024, 9, 30, 12, 0)), Season::Summer);
        assert_eq!(season(&local(2024, 10, 1, 12, 0)), Season::Winter);
    }

    #[test]
    fn period_is_pure() {
        let t = local(2024, 8, 5, 16, 30);
        let first = period(&t);
        for _ in 0..10 {
            assert_eq!(period(&t), first);
        }
    }

    #[test]
    fn tariff_converts_utc_to_installation_time() {
        let tariff = Tariff::default();
        // 19:00Z is 15:00 EDT.
        let now = Utc.with_ymd_and_hms(2024, 7, 17, 19, 0, 0).unwrap();
        assert_eq!(tariff.period_at(now), TariffPeriod::SuperPeak);
        // 07:00Z is 02:00 EST.
        let night = Utc.with_ymd_and_hms(2024, 1, 10, 7, 0, 0).unwrap();
        assert_eq!(tariff.period_at(night), TariffPeriod::OffPeak);
        assert_eq!(tariff.rate_at(night), 0.0249);
    }

    #[test]
    fn period_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TariffPeriod::SuperPeak).unwrap(),
            "\"super_peak\""
        );
        assert_eq!(TariffPeriod::OffPeak.to_string(), "off_peak");
    }
}
