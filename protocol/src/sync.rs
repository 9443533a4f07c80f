//! Wire types for the driver <-> server target exchange, and the driver's client.

use crate::channel::{names, ChannelValue, Slate};
use crate::tariff::TariffPeriod;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const SYNC_PATH: &str = "/api/driver/sync";

/// Target field that has no same-named read-back channel.
pub const BATTERY_CHARGE_POWER: &str = "battery_charge_power";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    Manual,
    #[default]
    Tou,
}

impl fmt::Display for AutomationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AutomationMode::Manual => "manual",
            AutomationMode::Tou => "tou",
        })
    }
}

/// Flat set of device setpoints plus the annotations the driver acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetVector {
    pub heater_power: bool,
    pub heater_target_temp: i64,
    pub heater_oscillation: bool,
    pub heater_display: bool,
    pub plug_on: bool,
    pub battery_charge_power: i64,

    #[serde(default)]
    pub sleep_mode_active: bool,
    #[serde(default)]
    pub safety_override: bool,
    pub tariff_period: TariffPeriod,
    pub automation_mode: AutomationMode,
    pub driver_control_enabled: bool,
}

impl TargetVector {
    /// The writable fields as (target field, value), in application order.
    pub fn commands(&self) -> [(&'static str, ChannelValue); 6] {
        [
            (names::HEATER_TARGET_TEMP, ChannelValue::Int(self.heater_target_temp)),
            (names::HEATER_POWER, ChannelValue::Bool(self.heater_power)),
            (names::HEATER_OSCILLATION, ChannelValue::Bool(self.heater_oscillation)),
            (names::HEATER_DISPLAY, ChannelValue::Bool(self.heater_display)),
            (names::PLUG_ON, ChannelValue::Bool(self.plug_on)),
            (BATTERY_CHARGE_POWER, ChannelValue::Int(self.battery_charge_power)),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub channels: Slate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub targets: TargetVector,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("exchange timed out")]
    Timeout,
    #[error("server answered {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Http(e)
        }
    }
}

/// Posts slate snapshots to the target server.
#[derive(Debug, Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    url: String,
}

impl SyncClient {
    pub fn new(server_url: &str, timeout: Duration) -> Result<SyncClient> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for target exchange")?;
        Ok(SyncClient {
            http,
            url: format!("{}{}", server_url.trim_end_matches('/'), SYNC_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn exchange(&self, slate: &Slate) -> Result<SyncResponse, TransportError> {
        let request = SyncRequest {
            channels: slate.clone(),
        };
        let response = self.http.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    fn sample_targets() -> TargetVector {
        TargetVector {
            heater_power: true,
            heater_target_temp: 70,
            heater_oscillation: false,
            heater_display: true,
            plug_on: true,
            battery_charge_power: 0,
            sleep_mode_active: false,
            safety_override: false,
            tariff_period: TariffPeriod::Peak,
            automation_mode: AutomationMode::Tou,
            driver_control_enabled: true,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn target_vector_is_flat_json() {
        let value = serde_json::to_value(sample_targets()).unwrap();
        assert_eq!(value["heater_target_temp"], json!(70));
        assert_eq!(value["battery_charge_power"], json!(0));
        assert_eq!(value["tariff_period"], json!("peak"));
        assert_eq!(value["automation_mode"], json!("tou"));
        assert_eq!(value["driver_control_enabled"], json!(true));
    }

    #[test]
    fn commands_cover_every_writable_field() {
        let commands = sample_targets().commands();
        let fields: Vec<&str> = commands.iter().map(|(f, _)| *f).collect();
        assert_eq!(
            fields,
            vec![
                "heater_target_temp",
                "heater_power",
                "heater_oscillation",
                "heater_display",
                "plug_on",
                "battery_charge_power",
            ]
        );
    }

    #[tokio::test]
    async fn exchange_round_trips_through_server() {
        let app = Router::new().route(
            SYNC_PATH,
            post(|Json(request): Json<SyncRequest>| async move {
                let mut targets = sample_targets();
                targets.heater_target_temp = request
                    .channels
                    .get_i64(names::HEATER_CURRENT_TEMP)
                    .unwrap_or(0);
                Json(SyncResponse { targets })
            }),
        );
        let base = serve(app).await;
        let client = SyncClient::new(&format!("{}/", base), Duration::from_secs(2)).unwrap();
        assert!(client.url().ends_with("/api/driver/sync"));

        let mut slate = Slate::new();
        slate.set(names::HEATER_CURRENT_TEMP, ChannelValue::Int(66));
        let response = client.exchange(&slate).await.unwrap();
        assert_eq!(response.targets.heater_target_temp, 66);
    }

    #[tokio::test]
    async fn server_error_is_a_transport_error() {
        let app = Router::new().route(SYNC_PATH, post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let base = serve(app).await;
        let client = SyncClient::new(&base, Duration::from_secs(2)).unwrap();

        let err = client.exchange(&Slate::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Status(500)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let client = SyncClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(client.exchange(&Slate::new()).await.is_err());
    }
}
