use crate::engine::EngineParams;
use anyhow::{Context, Result};
use chrono_tz::Tz;
use heat_protocol::tariff::{RateTable, Tariff, DEFAULT_TIMEZONE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "HEAT_SERVER_CONFIG";

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_timezone() -> Tz {
    DEFAULT_TIMEZONE
}

fn default_capacity_kwh() -> f64 {
    3.6
}

fn default_retention_hours() -> u64 {
    48
}

fn default_poll_interval_secs() -> f64 {
    1.0
}

/// Upper bound for the poll interval, in seconds.
const MAX_POLL_INTERVAL_SECS: f64 = 86_400.0;

/// Longest history window kept in memory, one year.
pub const MAX_RETENTION_HOURS: u64 = 24 * 366;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            listen: default_listen(),
            state_path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffConfig {
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default)]
    pub rates: RateTable,
}

impl Default for TariffConfig {
    fn default() -> Self {
        TariffConfig {
            timezone: default_timezone(),
            rates: RateTable::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    #[serde(default = "default_capacity_kwh")]
    pub capacity_kwh: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        BatteryConfig {
            capacity_kwh: default_capacity_kwh(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Driver poll period; each reading stands for this much time.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            retention_hours: default_retention_hours(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl HistoryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(0.0))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.min(MAX_RETENTION_HOURS) as i64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpConfig,
    #[serde(default)]
    pub tariff: TariffConfig,
    #[serde(default)]
    pub engine: EngineParams,
    #[serde(default)]
    pub battery: BatteryConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl ServerConfig {
    /// Reads `path`, or `$HEAT_SERVER_CONFIG`, or falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from));
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                ServerConfig::parse(&text)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => ServerConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<ServerConfig> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        anyhow::ensure!(
            self.battery.capacity_kwh.is_finite() && self.battery.capacity_kwh > 0.0,
            "battery capacity must be positive, got {} kWh",
            self.battery.capacity_kwh
        );
        anyhow::ensure!(
            self.history.poll_interval_secs > 0.0
                && self.history.poll_interval_secs <= MAX_POLL_INTERVAL_SECS,
            "history poll interval must be within 0..={} seconds, got {}",
            MAX_POLL_INTERVAL_SECS,
            self.history.poll_interval_secs
        );
        anyhow::ensure!(
            (1..=MAX_RETENTION_HOURS).contains(&self.history.retention_hours),
            "history retention must be 1..={} hours, got {}",
            MAX_RETENTION_HOURS,
            self.history.retention_hours
        );
        Ok(())
    }

    pub fn tariff(&self) -> Tariff {
        Tariff::new(self.tariff.rates, self.tariff.timezone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.server.listen, default_listen());
        assert_eq!(config.tariff.timezone, chrono_tz::America::New_York);
        assert_eq!(config.tariff.rates, RateTable::default());
        assert_eq!(config.engine, EngineParams::default());
        assert_eq!(config.battery.capacity_kwh, 3.6);
        config.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let config = ServerConfig::parse(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            state_path = "/var/lib/apt-heat/state.json"

            [tariff]
            timezone = "America/Chicago"
            [tariff.rates]
            winter_peak = 0.2

            [engine]
            hysteresis_f = 3
            charge_boost_watts = 1200

            [battery]
            capacity_kwh = 7.2
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.tariff.timezone, chrono_tz::America::Chicago);
        assert_eq!(config.tariff.rates.winter_peak, 0.2);
        assert_eq!(config.tariff.rates.offpeak, 0.0249);
        assert_eq!(config.engine.hysteresis_f, 3);
        assert_eq!(config.engine.charge_boost_watts, 1200);
        assert_eq!(config.engine.coast_offset_f, 3);
        assert_eq!(config.battery.capacity_kwh, 7.2);
    }

    #[test]
    fn zero_hysteresis_is_rejected() {
        let config = ServerConfig::parse("[engine]\nhysteresis_f = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn infinite_poll_interval_is_rejected() {
        let config = ServerConfig::parse("[history]\npoll_interval_secs = inf\n").unwrap();
        assert!(config.validate().is_err());
        let config = ServerConfig::parse("[history]\npoll_interval_secs = nan\n").unwrap();
        assert!(config.validate().is_err());
        let config = ServerConfig::parse("[battery]\ncapacity_kwh = inf\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn retention_is_bounded() {
        let config = ServerConfig::parse("[history]\nretention_hours = 3000000000000000\n").unwrap();
        assert!(config.validate().is_err());
        assert_eq!(
            config.history.retention(),
            chrono::Duration::hours(MAX_RETENTION_HOURS as i64)
        );
        let config = ServerConfig::parse("[history]\nretention_hours = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        fs::write(&path, "[history]\nretention_hours = 6\n").unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.history.retention_hours, 6);
        assert!(ServerConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
