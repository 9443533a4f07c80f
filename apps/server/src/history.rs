use crate::savings::Reading;
use chrono::{DateTime, Duration, Utc};
use heat_protocol::channel::{names, Slate};

/// Recent readings, oldest first, trimmed to a retention window.
#[derive(Debug, Clone)]
pub struct ReadingHistory {
    readings: Vec<Reading>,
    retention: Duration,
}

impl ReadingHistory {
    pub fn new(retention: Duration) -> ReadingHistory {
        ReadingHistory {
            readings: Vec::new(),
            retention,
        }
    }

    pub fn record(&mut self, reading: Reading) {
        let cutoff = reading.timestamp - self.retention;
        self.readings.push(reading);
        let expired = self.readings.partition_point(|r| r.timestamp < cutoff);
        self.readings.drain(..expired);
    }

    /// Readings at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> &[Reading] {
        let start = self.readings.partition_point(|r| r.timestamp < since);
        &self.readings[start..]
    }

    /// Evenly spaced subset of at most `max_points`, always keeping the newest.
    pub fn downsampled(&self, since: DateTime<Utc>, max_points: usize) -> Vec<Reading> {
        let readings = self.since(since);
        if max_points == 0 || readings.len() <= max_points {
            return readings.to_vec();
        }
        let step = readings.len() as f64 / max_points as f64;
        let mut sampled: Vec<Reading> = (0..max_points)
            .map(|i| readings[(i as f64 * step) as usize].clone())
            .collect();
        if let (Some(last), Some(newest)) = (sampled.last_mut(), readings.last()) {
            *last = newest.clone();
        }
        sampled
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Builds a history sample from a driver snapshot.
///
/// Battery output is the best measure of what the heater drew; the heater's
/// own estimate from its active level is the fallback.
pub fn reading_from_slate(slate: &Slate, target_temp_f: i64, at: DateTime<Utc>) -> Reading {
    let power_watts = slate
        .get_i64(names::BATTERY_WATTS_OUT)
        .or_else(|| slate.get_i64(names::HEATER_POWER_WATTS));
    Reading {
        timestamp: at,
        power_watts,
        battery_soc: slate.get_i64(names::BATTERY_SOC),
        current_temp_f: slate.get_i64(names::HEATER_CURRENT_TEMP),
        target_temp_f: Some(target_temp_f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use heat_protocol::channel::ChannelValue;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn sample(minute: i64) -> Reading {
        Reading {
            timestamp: at(minute),
            power_watts: Some(minute),
            battery_soc: None,
            current_temp_f: None,
            target_temp_f: None,
        }
    }

    #[test]
    fn old_readings_fall_out_of_the_window() {
        let mut history = ReadingHistory::new(Duration::minutes(30));
        for minute in 0..=60 {
            history.record(sample(minute));
        }
        assert_eq!(history.len(), 31);
        assert_eq!(history.since(at(0))[0].timestamp, at(30));
    }

    #[test]
    fn since_filters_by_timestamp() {
        let mut history = ReadingHistory::new(Duration::hours(1));
        for minute in 0..10 {
            history.record(sample(minute));
        }
        assert_eq!(history.since(at(7)).len(), 3);
        assert!(history.since(at(20)).is_empty());
    }

    #[test]
    fn downsampling_keeps_newest() {
        let mut history = ReadingHistory::new(Duration::hours(24));
        for minute in 0..100 {
            history.record(sample(minute));
        }
        let points = history.downsampled(at(0), 10);
        assert_eq!(points.len(), 10);
        assert_eq!(points[0].timestamp, at(0));
        assert_eq!(points[9].timestamp, at(99));
        assert_eq!(history.downsampled(at(0), 500).len(), 100);
    }

    #[test]
    fn reading_prefers_battery_output() {
        let now = at(0);
        let mut slate = Slate::new();
        slate.set(names::HEATER_POWER_WATTS, ChannelValue::Int(750));
        slate.set(names::BATTERY_SOC, ChannelValue::Int(64));
        let reading = reading_from_slate(&slate, 70, now);
        assert_eq!(reading.power_watts, Some(750));
        assert_eq!(reading.battery_soc, Some(64));

        slate.set(names::BATTERY_WATTS_OUT, ChannelValue::Int(1420));
        let reading = reading_from_slate(&slate, 70, now);
        assert_eq!(reading.power_watts, Some(1420));
        assert_eq!(reading.target_temp_f, Some(70));
    }
}
