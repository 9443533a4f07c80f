// Sleep mode: a one-off temperature curve stretched between "now" and a wake time.
// Curve points are (progress, temperature) with progress running 0.0 -> 1.0
// across the night.

use crate::intent::{MAX_TARGET_TEMP_F, MIN_TARGET_TEMP_F};
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("wake time {wake} is not after start time {start}")]
    WakeNotAfterStart {
        start: DateTime<Utc>,
        wake: DateTime<Utc>,
    },
    #[error("curve needs at least 2 points, got {0}")]
    TooFewPoints(usize),
    #[error("curve point {index} has progress {progress} outside [0, 1]")]
    ProgressOutOfRange { index: usize, progress: f64 },
    #[error("curve point {0} is not in ascending progress order")]
    NotAscending(usize),
    #[error("curve must start at progress 0 and end at progress 1")]
    OpenEnded,
    #[error("curve point {index} temperature {temp} is outside the supported range")]
    TempOutOfRange { index: usize, temp: f64 },
    #[error("unrecognized wake time {0:?}")]
    BadWakeTime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub progress: f64,
    pub temp: f64,
}

impl CurvePoint {
    pub fn new(progress: f64, temp: f64) -> CurvePoint {
        CurvePoint { progress, temp }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SleepTarget {
    Active { temp_f: i64, progress: f64 },
    /// Outside the schedule window; the owner must clear the schedule.
    Inactive,
}

/// A validated sleep schedule. Only constructible through [`SleepSchedule::new`]
/// (deserialisation goes through the same checks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSleepSchedule")]
pub struct SleepSchedule {
    start_time: DateTime<Utc>,
    wake_time: DateTime<Utc>,
    curve: Vec<CurvePoint>,
}

#[derive(Deserialize)]
struct RawSleepSchedule {
    start_time: DateTime<Utc>,
    wake_time: DateTime<Utc>,
    curve: Vec<CurvePoint>,
}

impl TryFrom<RawSleepSchedule> for SleepSchedule {
    type Error = ScheduleError;

    fn try_from(raw: RawSleepSchedule) -> Result<Self, Self::Error> {
        SleepSchedule::new(raw.start_time, raw.wake_time, raw.curve)
    }
}

impl SleepSchedule {
    pub fn new(
        start_time: DateTime<Utc>,
        wake_time: DateTime<Utc>,
        curve: Vec<CurvePoint>,
    ) -> Result<SleepSchedule, ScheduleError> {
        if wake_time <= start_time {
            return Err(ScheduleError::WakeNotAfterStart {
                start: start_time,
                wake: wake_time,
            });
        }
        validate_curve(&curve)?;
        Ok(SleepSchedule {
            start_time,
            wake_time,
            curve,
        })
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn wake_time(&self) -> DateTime<Utc> {
        self.wake_time
    }

    pub fn curve(&self) -> &[CurvePoint] {
        &self.curve
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now <= self.wake_time
    }

    pub fn progress(&self, now: DateTime<Utc>) -> f64 {
        let total = (self.wake_time - self.start_time).num_milliseconds() as f64;
        let elapsed = (now - self.start_time).num_milliseconds() as f64;
        (elapsed / total).clamp(0.0, 1.0)
    }

    pub fn target_at(&self, now: DateTime<Utc>) -> SleepTarget {
        if !self.contains(now) {
            return SleepTarget::Inactive;
        }
        let progress = self.progress(now);
        let temp = interpolate(&self.curve, progress);
        SleepTarget::Active {
            temp_f: temp.round() as i64,
            progress,
        }
    }
}

fn validate_curve(curve: &[CurvePoint]) -> Result<(), ScheduleError> {
    if curve.len() < 2 {
        return Err(ScheduleError::TooFewPoints(curve.len()));
    }
    for (index, point) in curve.iter().enumerate() {
        if !(0.0..=1.0).contains(&point.progress) {
            return Err(ScheduleError::ProgressOutOfRange {
                index,
                progress: point.progress,
            });
        }
        if !point.temp.is_finite()
            || point.temp < MIN_TARGET_TEMP_F as f64
            || point.temp > MAX_TARGET_TEMP_F as f64
        {
            return Err(ScheduleError::TempOutOfRange {
                index,
                temp: point.temp,
            });
        }
        if index > 0 && point.progress < curve[index - 1].progress {
            return Err(ScheduleError::NotAscending(index));
        }
    }
    if curve[0].progress != 0.0 || curve[curve.len() - 1].progress != 1.0 {
        return Err(ScheduleError::OpenEnded);
    }
    Ok(())
}

fn linear(val_start: f64, val_end: f64, x_start: f64, x_end: f64, x_target: f64) -> f64 {
    if x_end == x_start {
        return val_start;
    }
    let progress = ((x_target - x_start) / (x_end - x_start)).clamp(0.0, 1.0);
    val_end * progress + val_start * (1.0 - progress)
}

fn interpolate(curve: &[CurvePoint], progress: f64) -> f64 {
    for pair in curve.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.progress <= progress && progress <= next.progress {
            return linear(prev.temp, next.temp, prev.progress, next.progress, progress);
        }
    }
    // Only reachable through float error past the last point.
    curve.last().map_or(0.0, |p| p.temp)
}

/// Parses "7:00 AM" / "07:00 pm" / "22:30".
pub fn parse_wake_time(text: &str) -> Result<NaiveTime, ScheduleError> {
    let trimmed = text.trim();
    ["%I:%M %p", "%I:%M%p", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| ScheduleError::BadWakeTime(text.to_string()))
}

fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    // A wall-clock time inside a DST gap does not exist; use the hour after.
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

/// Next local occurrence of `wake` strictly after `now`.
pub fn next_wake(now: DateTime<Utc>, wake: NaiveTime, tz: &Tz) -> Option<DateTime<Utc>> {
    let local_now = now.with_timezone(tz);
    let mut date = local_now.date_naive();
    for _ in 0..2 {
        if let Some(candidate) = resolve_local(tz, date.and_time(wake)) {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return Some(candidate);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

/// Builds a schedule running from `now` until the next `wake_text` wall-clock time.
pub fn start_sleep(
    now: DateTime<Utc>,
    wake_text: &str,
    curve: Vec<CurvePoint>,
    tz: &Tz,
) -> Result<SleepSchedule, ScheduleError> {
    let wake = parse_wake_time(wake_text)?;
    let wake_time =
        next_wake(now, wake, tz).ok_or_else(|| ScheduleError::BadWakeTime(wake_text.to_string()))?;
    SleepSchedule::new(now, wake_time, curve)
}
