use heat_protocol::sync::AutomationMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_TARGET_TEMP_F: i64 = 41;
pub const MAX_TARGET_TEMP_F: i64 = 95;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntentError {
    #[error("battery charge power must be >= 0 W, got {0}")]
    NegativeChargePower(i64),
}

/// What the user asked for. Overlays in the engine start from this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserIntent {
    pub target_temp_f: i64,
    pub heater_power: bool,
    pub oscillation: bool,
    pub display: bool,
    pub plug_on: bool,
    pub battery_charge_watts: i64,
}

impl Default for UserIntent {
    fn default() -> Self {
        UserIntent {
            target_temp_f: 70,
            heater_power: true,
            oscillation: false,
            display: true,
            plug_on: true,
            battery_charge_watts: 300,
        }
    }
}

impl UserIntent {
    /// Stores the temperature clamped into the supported range and returns it.
    pub fn set_target_temp(&mut self, temp_f: i64) -> i64 {
        self.target_temp_f = temp_f.clamp(MIN_TARGET_TEMP_F, MAX_TARGET_TEMP_F);
        self.target_temp_f
    }

    pub fn set_battery_charge_watts(&mut self, watts: i64) -> Result<i64, IntentError> {
        if watts < 0 {
            return Err(IntentError::NegativeChargePower(watts));
        }
        self.battery_charge_watts = watts;
        Ok(watts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationSettings {
    pub driver_control_enabled: bool,
    pub automation_mode: AutomationMode,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        AutomationSettings {
            driver_control_enabled: true,
            automation_mode: AutomationMode::Tou,
        }
    }
}
