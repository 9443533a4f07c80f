use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Well-known channel names shared by the driver and the target engine.
pub mod names {
    pub const HEATER_POWER: &str = "heater_power";
    pub const HEATER_CURRENT_TEMP: &str = "heater_current_temp";
    pub const HEATER_TARGET_TEMP: &str = "heater_target_temp";
    pub const HEATER_HEAT_MODE: &str = "heater_heat_mode";
    pub const HEATER_OSCILLATION: &str = "heater_oscillation";
    pub const HEATER_DISPLAY: &str = "heater_display";
    pub const HEATER_ACTIVE_HEAT_LEVEL: &str = "heater_active_heat_level";
    pub const HEATER_POWER_WATTS: &str = "heater_power_watts";

    pub const PLUG_ON: &str = "plug_on";

    pub const BATTERY_SOC: &str = "battery_soc";
    pub const BATTERY_AC_CHARGE_WATTS: &str = "battery_ac_charge_watts";
    pub const BATTERY_WATTS_IN: &str = "battery_watts_in";
    pub const BATTERY_WATTS_OUT: &str = "battery_watts_out";
}

// Active heat level -> estimated draw. Medium and high differ only by fan speed.
const HEATER_LEVEL_WATTS: &[(&str, i64)] = &[
    ("off", 0),
    ("stop", 0),
    ("low", 750),
    ("medium", 1500),
    ("high", 1500),
];

/// Estimated heater wattage for a reported active heat level.
pub fn estimated_heater_watts(level: &str) -> Option<i64> {
    HEATER_LEVEL_WATTS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(level))
        .map(|&(_, watts)| watts)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ChannelValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ChannelValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChannelValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ChannelValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a loosely typed JSON value as returned by device bridges.
    ///
    /// `null` maps to `None` so a partial response never erases a known value.
    /// Integral floats become integers; other scalars are kept as text.
    pub fn from_json(value: &serde_json::Value) -> Option<ChannelValue> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(ChannelValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ChannelValue::Int(i))
                } else {
                    match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                            Some(ChannelValue::Int(f as i64))
                        }
                        _ => Some(ChannelValue::Str(n.to_string())),
                    }
                }
            }
            Value::String(s) => Some(ChannelValue::Str(s.clone())),
            other => Some(ChannelValue::Str(other.to_string())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ChannelValue::Bool(b) => serde_json::Value::from(*b),
            ChannelValue::Int(i) => serde_json::Value::from(*i),
            ChannelValue::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl From<bool> for ChannelValue {
    fn from(b: bool) -> Self {
        ChannelValue::Bool(b)
    }
}

impl From<i64> for ChannelValue {
    fn from(i: i64) -> Self {
        ChannelValue::Int(i)
    }
}

impl From<&str> for ChannelValue {
    fn from(s: &str) -> Self {
        ChannelValue::Str(s.to_string())
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Bool(b) => write!(f, "{}", b),
            ChannelValue::Int(i) => write!(f, "{}", i),
            ChannelValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// One telemetry/control point as last observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub value: Option<ChannelValue>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Channel name -> last observed value. A missing entry means "never observed".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slate {
    channels: HashMap<String, Channel>,
}

impl Slate {
    pub fn new() -> Slate {
        Slate::default()
    }

    pub fn set(&mut self, name: &str, value: ChannelValue) {
        self.set_at(name, value, Utc::now());
    }

    pub fn set_at(&mut self, name: &str, value: ChannelValue, at: DateTime<Utc>) {
        let channel = self.channels.entry(name.to_string()).or_default();
        channel.value = Some(value);
        channel.last_updated = Some(at);
    }

    /// Merges a device response into the slate, skipping absent values.
    /// Returns how many channels were updated.
    pub fn apply_reading<I>(&mut self, fields: I) -> usize
    where
        I: IntoIterator<Item = (String, Option<ChannelValue>)>,
    {
        let now = Utc::now();
        let mut updated = 0;
        for (name, value) in fields {
            if let Some(value) = value {
                self.set_at(&name, value, now);
                updated += 1;
            }
        }
        updated
    }

    pub fn get(&self, name: &str) -> Option<&ChannelValue> {
        self.channels.get(name).and_then(|c| c.value.as_ref())
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ChannelValue::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ChannelValue::as_bool)
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Channel)> {
        self.channels.iter()
    }
}
