use crate::device::DeviceKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "HEAT_DRIVER_CONFIG";

/// Upper bound for the period and timeouts, in seconds.
const MAX_SECS: f64 = 86_400.0;

fn default_period_secs() -> f64 {
    1.0
}

fn default_server_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_exchange_timeout_secs() -> f64 {
    10.0
}

fn default_device_timeout_secs() -> f64 {
    5.0
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    5
}

/// One device bridge. A device without a url is not driven.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub url: Option<String>,
    /// Read on every Nth cycle.
    #[serde(default)]
    pub read_every: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicesConfig {
    #[serde(default)]
    pub heater: DeviceConfig,
    #[serde(default)]
    pub plug: DeviceConfig,
    #[serde(default)]
    pub battery: DeviceConfig,
}

impl DevicesConfig {
    pub fn get(&self, kind: DeviceKind) -> &DeviceConfig {
        match kind {
            DeviceKind::Heater => &self.heater,
            DeviceKind::Plug => &self.plug,
            DeviceKind::Battery => &self.battery,
        }
    }

    /// The battery sits behind a rate-limited cloud API and is polled less often.
    pub fn read_every(&self, kind: DeviceKind) -> u64 {
        let default = match kind {
            DeviceKind::Battery => 5,
            DeviceKind::Heater | DeviceKind::Plug => 1,
        };
        self.get(kind).read_every.unwrap_or(default).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_period_secs")]
    pub period_secs: f64,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_exchange_timeout_secs")]
    pub exchange_timeout_secs: f64,
    #[serde(default = "default_device_timeout_secs")]
    pub device_timeout_secs: f64,
    /// Absent devices are reconnected every this many cycles.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    /// Consecutive failures before a device handle is dropped.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub devices: DevicesConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            period_secs: default_period_secs(),
            server_url: default_server_url(),
            exchange_timeout_secs: default_exchange_timeout_secs(),
            device_timeout_secs: default_device_timeout_secs(),
            reconnect_interval: default_reconnect_interval(),
            failure_threshold: default_failure_threshold(),
            devices: DevicesConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Reads `path`, or `$HEAT_DRIVER_CONFIG`, or falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<DriverConfig> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from));
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => DriverConfig::default(),
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("poll period", self.period_secs),
            ("exchange timeout", self.exchange_timeout_secs),
            ("device timeout", self.device_timeout_secs),
        ] {
            anyhow::ensure!(
                secs > 0.0 && secs <= MAX_SECS,
                "{} must be within 0..={} seconds, got {}",
                name,
                MAX_SECS,
                secs
            );
        }
        anyhow::ensure!(self.reconnect_interval > 0, "reconnect interval must be at least 1");
        anyhow::ensure!(self.failure_threshold > 0, "failure threshold must be at least 1");
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.exchange_timeout_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.device_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: DriverConfig = toml::from_str("").unwrap();
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.reconnect_interval, 30);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.devices.read_every(DeviceKind::Heater), 1);
        assert_eq!(config.devices.read_every(DeviceKind::Battery), 5);
        config.validate().unwrap();
    }

    #[test]
    fn device_sections() {
        let config: DriverConfig = toml::from_str(
            r#"
            period_secs = 2.5
            server_url = "https://heat.example.net"

            [devices.heater]
            url = "http://127.0.0.1:7001"

            [devices.battery]
            url = "http://127.0.0.1:7003"
            read_every = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.period(), Duration::from_millis(2500));
        assert_eq!(config.devices.heater.url.as_deref(), Some("http://127.0.0.1:7001"));
        assert_eq!(config.devices.plug.url, None);
        assert_eq!(config.devices.read_every(DeviceKind::Battery), 10);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let config: DriverConfig = toml::from_str("failure_threshold = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_finite_durations_are_rejected() {
        for text in [
            "period_secs = inf",
            "exchange_timeout_secs = inf",
            "device_timeout_secs = nan",
            "period_secs = -1.0",
            "period_secs = 1e300",
        ] {
            let config: DriverConfig = toml::from_str(text).unwrap();
            assert!(config.validate().is_err(), "{} accepted", text);
        }
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        fs::write(&path, "reconnect_interval = 3\n").unwrap();
        assert_eq!(DriverConfig::load(Some(&path)).unwrap().reconnect_interval, 3);
    }
}
