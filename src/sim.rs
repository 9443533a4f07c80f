//! In-process stand-ins for the heater, plug and battery.
//!
//! All three share one [`SimWorld`]: the heater warms a room that leaks heat to
//! the outside, the battery feeds the heater and is charged from the grid
//! while the plug is on.

use crate::device::{DeviceClient, DeviceConnector, DeviceError, DeviceKind, FieldMap};
use async_trait::async_trait;
use heat_protocol::channel::{estimated_heater_watts, names, ChannelValue};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SimWorld {
    pub heater_power: bool,
    pub target_temp_f: i64,
    pub oscillation: bool,
    pub display: bool,
    pub plug_on: bool,
    pub ac_charge_watts: i64,
    pub soc: f64,
    pub room_f: f64,
    heater_f: f64,
    outside_f: f64,
    capacity_wh: f64,
    watts_in: i64,
    watts_out: i64,
    last_step: Instant,
}

impl Default for SimWorld {
    fn default() -> Self {
        SimWorld {
            heater_power: true,
            target_temp_f: 70,
            oscillation: false,
            display: true,
            plug_on: true,
            ac_charge_watts: 300,
            soc: 80.0,
            room_f: 64.0,
            heater_f: 64.0,
            outside_f: 40.0,
            capacity_wh: 3600.0,
            watts_in: 0,
            watts_out: 0,
            last_step: Instant::now(),
        }
    }
}

/// Moves heat from the warmer body to the cooler one.
fn exchange(t1: &mut f64, weight1: f64, t2: &mut f64, weight2: f64, speed: f64) {
    let energy1 = *t1 * weight1;
    let energy2 = *t2 * weight2;
    let exchanged = (*t1 - *t2) * speed;
    *t1 = (energy1 - exchanged) / weight1;
    *t2 = (energy2 + exchanged) / weight2;
}

impl SimWorld {
    /// Heat level the built-in thermostat picks for the current room temperature.
    pub fn heat_level(&self) -> &'static str {
        if !self.heater_power || (self.soc <= 0.0 && !self.plug_on) {
            "off"
        } else if self.room_f < self.target_temp_f as f64 - 1.0 {
            "high"
        } else if self.room_f < self.target_temp_f as f64 {
            "low"
        } else {
            "off"
        }
    }

    /// Advances the model by `secs` seconds.
    pub fn step(&mut self, secs: f64) {
        let heater_watts = estimated_heater_watts(self.heat_level()).unwrap_or(0);
        let charge_watts = if self.plug_on { self.ac_charge_watts.max(0) } else { 0 };
        let battery_full = self.soc >= 100.0;

        // With the plug on the grid carries the heater; otherwise the battery does.
        self.watts_in = if battery_full { 0 } else { charge_watts };
        self.watts_out = if self.plug_on { 0 } else { heater_watts };
        let net_wh = (self.watts_in - self.watts_out) as f64 * secs / 3600.0;
        self.soc = (self.soc + net_wh / self.capacity_wh * 100.0).clamp(0.0, 100.0);

        // One second per iteration keeps the exchange rates stable.
        let mut remaining = secs;
        while remaining > 0.0 {
            let dt = remaining.min(1.0);
            self.heater_f += heater_watts as f64 * 0.0001 * dt;
            exchange(&mut self.heater_f, 0.5, &mut self.room_f, 1.0, 0.03 * dt);
            let mut outside = self.outside_f;
            exchange(&mut self.room_f, 1.0, &mut outside, 1000.0, 0.0005 * dt);
            remaining -= dt;
        }
    }

    fn advance(&mut self) {
        let now = Instant::now();
        let secs = now.duration_since(self.last_step).as_secs_f64();
        self.last_step = now;
        self.step(secs);
    }
}

pub type SharedWorld = Arc<Mutex<SimWorld>>;

fn lock(world: &SharedWorld) -> Result<MutexGuard<'_, SimWorld>, DeviceError> {
    world
        .lock()
        .map_err(|_| DeviceError::Transient("simulator state poisoned".to_string()))
}

fn rejected(field: &str, reason: &str) -> DeviceError {
    DeviceError::Rejected {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn expect_bool(field: &str, value: &ChannelValue) -> Result<bool, DeviceError> {
    value.as_bool().ok_or_else(|| rejected(field, "expected a boolean"))
}

fn expect_int(field: &str, value: &ChannelValue) -> Result<i64, DeviceError> {
    value.as_i64().ok_or_else(|| rejected(field, "expected an integer"))
}

fn fields<const N: usize>(values: [(&str, ChannelValue); N]) -> FieldMap {
    values
        .into_iter()
        .map(|(name, value)| (name.to_string(), Some(value)))
        .collect()
}

pub struct SimHeater {
    world: SharedWorld,
}

#[async_trait]
impl DeviceClient for SimHeater {
    async fn read(&self) -> Result<FieldMap, DeviceError> {
        let mut world = lock(&self.world)?;
        world.advance();
        Ok(fields([
            (names::HEATER_POWER, world.heater_power.into()),
            (names::HEATER_CURRENT_TEMP, (world.room_f.round() as i64).into()),
            (names::HEATER_TARGET_TEMP, world.target_temp_f.into()),
            (names::HEATER_HEAT_MODE, "auto".into()),
            (names::HEATER_OSCILLATION, world.oscillation.into()),
            (names::HEATER_DISPLAY, world.display.into()),
            (names::HEATER_ACTIVE_HEAT_LEVEL, world.heat_level().into()),
        ]))
    }

    async fn write(&self, field: &str, value: &ChannelValue) -> Result<(), DeviceError> {
        let mut world = lock(&self.world)?;
        world.advance();
        match field {
            names::HEATER_POWER => world.heater_power = expect_bool(field, value)?,
            names::HEATER_OSCILLATION => world.oscillation = expect_bool(field, value)?,
            names::HEATER_DISPLAY => world.display = expect_bool(field, value)?,
            names::HEATER_TARGET_TEMP => {
                let temp = expect_int(field, value)?;
                if !(41..=95).contains(&temp) {
                    return Err(rejected(field, "out of range"));
                }
                world.target_temp_f = temp;
            }
            _ => return Err(rejected(field, "not writable")),
        }
        Ok(())
    }
}

pub struct SimPlug {
    world: SharedWorld,
}

#[async_trait]
impl DeviceClient for SimPlug {
    async fn read(&self) -> Result<FieldMap, DeviceError> {
        let world = lock(&self.world)?;
        Ok(fields([(names::PLUG_ON, world.plug_on.into())]))
    }

    async fn write(&self, field: &str, value: &ChannelValue) -> Result<(), DeviceError> {
        let mut world = lock(&self.world)?;
        world.advance();
        match field {
            names::PLUG_ON => world.plug_on = expect_bool(field, value)?,
            _ => return Err(rejected(field, "not writable")),
        }
        Ok(())
    }
}

pub struct SimBattery {
    world: SharedWorld,
}

#[async_trait]
impl DeviceClient for SimBattery {
    async fn read(&self) -> Result<FieldMap, DeviceError> {
        let mut world = lock(&self.world)?;
        world.advance();
        Ok(fields([
            (names::BATTERY_SOC, (world.soc.round() as i64).into()),
            (names::BATTERY_WATTS_IN, world.watts_in.into()),
            (names::BATTERY_WATTS_OUT, world.watts_out.into()),
            (names::BATTERY_AC_CHARGE_WATTS, world.ac_charge_watts.into()),
        ]))
    }

    async fn write(&self, field: &str, value: &ChannelValue) -> Result<(), DeviceError> {
        let mut world = lock(&self.world)?;
        world.advance();
        match field {
            names::BATTERY_AC_CHARGE_WATTS => {
                let watts = expect_int(field, value)?;
                if watts < 0 {
                    return Err(rejected(field, "negative charge power"));
                }
                world.ac_charge_watts = watts;
            }
            _ => return Err(rejected(field, "not writable")),
        }
        Ok(())
    }
}

pub struct SimConnector {
    kind: DeviceKind,
    world: SharedWorld,
}

impl SimConnector {
    pub fn new(kind: DeviceKind, world: SharedWorld) -> SimConnector {
        SimConnector { kind, world }
    }
}

#[async_trait]
impl DeviceConnector for SimConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceClient>, DeviceError> {
        let world = self.world.clone();
        Ok(match self.kind {
            DeviceKind::Heater => Box::new(SimHeater { world }),
            DeviceKind::Plug => Box::new(SimPlug { world }),
            DeviceKind::Battery => Box::new(SimBattery { world }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_warms_towards_target_and_settles() {
        let mut world = SimWorld::default();
        assert_eq!(world.heat_level(), "high");
        for _ in 0..(4 * 3600) {
            world.step(1.0);
        }
        assert!(world.room_f >= 68.0, "room only reached {}", world.room_f);
        assert!(world.room_f < 73.0, "room overshot to {}", world.room_f);
    }

    #[test]
    fn heater_off_lets_room_cool() {
        let mut world = SimWorld {
            heater_power: false,
            room_f: 70.0,
            heater_f: 70.0,
            ..SimWorld::default()
        };
        world.step(3600.0);
        assert!(world.room_f < 70.0);
        assert_eq!(world.heat_level(), "off");
    }

    #[test]
    fn battery_carries_heater_with_plug_off() {
        let mut world = SimWorld {
            plug_on: false,
            ..SimWorld::default()
        };
        world.step(60.0);
        assert!(world.soc < 80.0);
        assert_eq!(world.watts_out, 1500);
        assert_eq!(world.watts_in, 0);

        let mut world = SimWorld {
            heater_power: false,
            ..SimWorld::default()
        };
        world.step(3600.0);
        assert!((world.soc - 88.33).abs() < 0.01);
    }

    #[tokio::test]
    async fn devices_share_one_world() {
        let world = SharedWorld::default();
        let heater = SimConnector::new(DeviceKind::Heater, world.clone())
            .connect()
            .await
            .unwrap();
        let battery = SimConnector::new(DeviceKind::Battery, world.clone())
            .connect()
            .await
            .unwrap();

        heater
            .write(names::HEATER_TARGET_TEMP, &ChannelValue::Int(66))
            .await
            .unwrap();
        let fields = heater.read().await.unwrap();
        assert_eq!(fields[names::HEATER_TARGET_TEMP], Some(ChannelValue::Int(66)));

        battery
            .write(names::BATTERY_AC_CHARGE_WATTS, &ChannelValue::Int(1500))
            .await
            .unwrap();
        assert_eq!(world.lock().unwrap().ac_charge_watts, 1500);

        let err = heater
            .write(names::HEATER_POWER, &ChannelValue::Int(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Rejected { .. }));
        assert!(battery.write(names::BATTERY_SOC, &ChannelValue::Int(5)).await.is_err());
    }
}
