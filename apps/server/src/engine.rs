//! Target engine: turns user intent, sleep mode, tariff automation and the latest
//! telemetry into one target vector.
//!
//! The vector is produced by seeding it from [`UserIntent`] and then running a
//! fixed, ordered list of overlay stages ([`OVERLAYS`]). A later stage wins on
//! any field it touches, so the safety overlay always has the last word before
//! annotation. The engine never touches persistence; anything that must be
//! stored or logged comes back as an [`EngineEffect`].

use crate::intent::{AutomationSettings, UserIntent, MIN_TARGET_TEMP_F};
use crate::sleep::{SleepSchedule, SleepTarget};
use chrono::{DateTime, Utc};
use heat_protocol::channel::{names, Slate};
use heat_protocol::sync::{AutomationMode, TargetVector};
use heat_protocol::tariff::{Tariff, TariffPeriod};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Off-peak bang-bang controller state. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OffpeakState {
    #[default]
    Heating,
    Charging,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("hysteresis band must be positive, got {0}°F")]
    Hysteresis(i64),
    #[error("charge boost must be >= 0 W, got {0}")]
    ChargeBoost(i64),
    #[error("coast offset must be >= 0°F, got {0}")]
    CoastOffset(i64),
    #[error("low battery threshold must be within 0..=100%, got {0}")]
    LowSoc(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParams {
    /// Degrees below the setpoint before CHARGING hands back to HEATING.
    pub hysteresis_f: i64,
    /// Battery charge power while CHARGING off-peak.
    pub charge_boost_watts: i64,
    /// How far the heater setpoint drops while the battery charges.
    pub coast_offset_f: i64,
    /// At or below this SOC with the plug off, the heater is forced off.
    pub low_soc_percent: i64,
}

impl Default for EngineParams {
    fn default() -> Self {
        EngineParams {
            hysteresis_f: 2,
            charge_boost_watts: 1500,
            coast_offset_f: 3,
            low_soc_percent: 5,
        }
    }
}

impl EngineParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.hysteresis_f <= 0 {
            return Err(ParamsError::Hysteresis(self.hysteresis_f));
        }
        if self.charge_boost_watts < 0 {
            return Err(ParamsError::ChargeBoost(self.charge_boost_watts));
        }
        if self.coast_offset_f < 0 {
            return Err(ParamsError::CoastOffset(self.coast_offset_f));
        }
        if !(0..=100).contains(&self.low_soc_percent) {
            return Err(ParamsError::LowSoc(self.low_soc_percent));
        }
        Ok(())
    }
}

/// Everything the engine remembers between exchanges.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub intent: UserIntent,
    pub settings: AutomationSettings,
    pub sleep: Option<SleepSchedule>,
    pub controller: OffpeakState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEffect {
    /// The sleep schedule has expired and must be deleted from the store.
    ClearSleepSchedule,
    /// Low battery with no mains: heater forced off.
    SafetyOverride { soc: i64 },
    ControllerTransition { from: OffpeakState, to: OffpeakState },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub targets: TargetVector,
    pub controller: OffpeakState,
    pub effects: Vec<EngineEffect>,
}

impl EngineState {
    /// Takes over the controller state and applies the in-memory part of the
    /// effects. Returns true when persisted state changed.
    pub fn absorb(&mut self, output: &EngineOutput) -> bool {
        self.controller = output.controller;
        let mut dirty = false;
        for effect in &output.effects {
            if *effect == EngineEffect::ClearSleepSchedule && self.sleep.take().is_some() {
                dirty = true;
            }
        }
        dirty
    }
}

struct Pass<'a> {
    now: DateTime<Utc>,
    slate: &'a Slate,
    state: &'a EngineState,
    params: &'a EngineParams,
    period: TariffPeriod,
    controller: OffpeakState,
    effects: Vec<EngineEffect>,
}

impl Pass<'_> {
    fn transition(&mut self, to: OffpeakState) {
        if self.controller != to {
            self.effects.push(EngineEffect::ControllerTransition {
                from: self.controller,
                to,
            });
            self.controller = to;
        }
    }
}

type Overlay = fn(TargetVector, &mut Pass<'_>) -> TargetVector;

/// Applied in this order after seeding from user intent.
const OVERLAYS: [(&str, Overlay); 4] = [
    ("sleep_override", sleep_override),
    ("tou_automation", tou_automation),
    ("safety", safety_overlay),
    ("annotate", annotate),
];

fn seed(intent: &UserIntent, settings: &AutomationSettings, period: TariffPeriod) -> TargetVector {
    TargetVector {
        heater_power: intent.heater_power,
        heater_target_temp: intent.target_temp_f,
        heater_oscillation: intent.oscillation,
        heater_display: intent.display,
        plug_on: intent.plug_on,
        battery_charge_power: intent.battery_charge_watts,
        sleep_mode_active: false,
        safety_override: false,
        tariff_period: period,
        automation_mode: settings.automation_mode,
        driver_control_enabled: settings.driver_control_enabled,
    }
}

fn sleep_override(mut targets: TargetVector, pass: &mut Pass<'_>) -> TargetVector {
    if let Some(schedule) = &pass.state.sleep {
        match schedule.target_at(pass.now) {
            SleepTarget::Active { temp_f, .. } => {
                targets.heater_target_temp = temp_f;
                targets.sleep_mode_active = true;
            }
            SleepTarget::Inactive => pass.effects.push(EngineEffect::ClearSleepSchedule),
        }
    }
    targets
}

fn tou_automation(mut targets: TargetVector, pass: &mut Pass<'_>) -> TargetVector {
    if pass.state.settings.automation_mode != AutomationMode::Tou {
        pass.transition(OffpeakState::Heating);
        return targets;
    }
    if pass.period != TariffPeriod::OffPeak {
        targets.battery_charge_power = 0;
        pass.transition(OffpeakState::Heating);
        return targets;
    }

    let desired = targets.heater_target_temp;
    // No reading: hold the current state, never invent a transition.
    if let Some(current) = pass.slate.get_i64(names::HEATER_CURRENT_TEMP) {
        match pass.controller {
            OffpeakState::Heating if current >= desired => {
                pass.transition(OffpeakState::Charging)
            }
            OffpeakState::Charging if current <= desired - pass.params.hysteresis_f => {
                pass.transition(OffpeakState::Heating)
            }
            _ => {}
        }
    }

    match pass.controller {
        OffpeakState::Heating => {
            targets.battery_charge_power = 0;
            targets.heater_target_temp = desired;
        }
        OffpeakState::Charging => {
            targets.battery_charge_power = pass.params.charge_boost_watts;
            targets.heater_target_temp = (desired - pass.params.coast_offset_f).max(MIN_TARGET_TEMP_F);
        }
    }
    targets
}

fn safety_overlay(mut targets: TargetVector, pass: &mut Pass<'_>) -> TargetVector {
    if let Some(soc) = pass.slate.get_i64(names::BATTERY_SOC) {
        if soc <= pass.params.low_soc_percent && !targets.plug_on {
            targets.heater_power = false;
            targets.safety_override = true;
            pass.effects.push(EngineEffect::SafetyOverride { soc });
        }
    }
    targets
}

fn annotate(mut targets: TargetVector, pass: &mut Pass<'_>) -> TargetVector {
    targets.tariff_period = pass.period;
    targets.automation_mode = pass.state.settings.automation_mode;
    targets.driver_control_enabled = pass.state.settings.driver_control_enabled;
    targets
}

/// Computes the target vector for `now`. Never fails; missing telemetry only
/// defers controller transitions.
pub fn compute_targets(
    now: DateTime<Utc>,
    slate: &Slate,
    state: &EngineState,
    params: &EngineParams,
    tariff: &Tariff,
) -> EngineOutput {
    let period = tariff.period_at(now);
    let mut pass = Pass {
        now,
        slate,
        state,
        params,
        period,
        controller: state.controller,
        effects: Vec::new(),
    };

    let mut targets = seed(&state.intent, &state.settings, period);
    for (_name, overlay) in OVERLAYS.iter() {
        targets = overlay(targets, &mut pass);
    }

    EngineOutput {
        targets,
        controller: pass.controller,
        effects: pass.effects,
    }
}
