//! HTTP JSON bridge in front of a vendor device.
//!
//! `GET {url}/status` answers a flat JSON object of channel-named fields.
//! `POST {url}/set` takes `{"field": .., "value": ..}` and answers 2xx on success.

use crate::device::{DeviceClient, DeviceConnector, DeviceError, FieldMap};
use async_trait::async_trait;
use heat_protocol::channel::ChannelValue;
use serde::Serialize;
use std::time::Duration;

fn transient(e: reqwest::Error) -> DeviceError {
    if e.is_timeout() {
        DeviceError::Timeout
    } else {
        DeviceError::Transient(e.to_string())
    }
}

pub struct BridgeConnector {
    url: String,
    timeout: Duration,
}

impl BridgeConnector {
    pub fn new(url: &str, timeout: Duration) -> BridgeConnector {
        BridgeConnector {
            url: url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl DeviceConnector for BridgeConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceClient>, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| DeviceError::Connect(e.to_string()))?;
        let device = BridgeDevice {
            http,
            url: self.url.clone(),
        };
        // A bridge that cannot answer a status request is not connected.
        device.status().await.map_err(|e| DeviceError::Connect(e.to_string()))?;
        Ok(Box::new(device))
    }
}

pub struct BridgeDevice {
    http: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct SetRequest<'a> {
    field: &'a str,
    value: serde_json::Value,
}

impl BridgeDevice {
    async fn status(&self) -> Result<FieldMap, DeviceError> {
        let response = self
            .http
            .get(format!("{}/status", self.url))
            .send()
            .await
            .map_err(transient)?;
        if !response.status().is_success() {
            return Err(DeviceError::Transient(format!(
                "bridge answered {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await.map_err(transient)?;
        let serde_json::Value::Object(fields) = body else {
            return Err(DeviceError::Transient("status is not a JSON object".to_string()));
        };
        Ok(fields
            .iter()
            .map(|(name, value)| (name.clone(), ChannelValue::from_json(value)))
            .collect())
    }
}

#[async_trait]
impl DeviceClient for BridgeDevice {
    async fn read(&self) -> Result<FieldMap, DeviceError> {
        let fields = self.status().await?;
        if fields.is_empty() {
            return Err(DeviceError::EmptyResponse);
        }
        Ok(fields)
    }

    async fn write(&self, field: &str, value: &ChannelValue) -> Result<(), DeviceError> {
        let response = self
            .http
            .post(format!("{}/set", self.url))
            .json(&SetRequest {
                field,
                value: value.to_json(),
            })
            .send()
            .await
            .map_err(transient)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(DeviceError::Rejected {
                field: field.to_string(),
                reason: format!("{}: {}", status, reason),
            })
        } else {
            Err(DeviceError::Transient(format!("bridge answered {}: {}", status, reason)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<Value>>>;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn bridge(status: Value, log: Log) -> Router {
        Router::new()
            .route("/status", get(move || async move { Json(status) }))
            .route(
                "/set",
                post(|State(log): State<Log>, Json(body): Json<Value>| async move {
                    if body["field"] == json!("heater_target_temp") && body["value"] == json!(200) {
                        return StatusCode::UNPROCESSABLE_ENTITY;
                    }
                    log.lock().unwrap().push(body);
                    StatusCode::OK
                }),
            )
            .with_state(log)
    }

    #[tokio::test]
    async fn reads_status_fields() {
        let log = Log::default();
        let url = serve(bridge(
            json!({"heater_power": true, "heater_current_temp": 67.0, "heater_heat_mode": null}),
            log,
        ))
        .await;
        let device = BridgeConnector::new(&url, Duration::from_secs(2))
            .connect()
            .await
            .unwrap();
        let fields = device.read().await.unwrap();
        assert_eq!(fields["heater_power"], Some(ChannelValue::Bool(true)));
        assert_eq!(fields["heater_current_temp"], Some(ChannelValue::Int(67)));
        assert_eq!(fields["heater_heat_mode"], None);
    }

    #[tokio::test]
    async fn empty_status_is_an_error() {
        let url = serve(bridge(json!({}), Log::default())).await;
        let device = BridgeConnector::new(&url, Duration::from_secs(2))
            .connect()
            .await
            .unwrap();
        assert!(matches!(device.read().await, Err(DeviceError::EmptyResponse)));
    }

    #[tokio::test]
    async fn writes_post_field_and_value() {
        let log = Log::default();
        let url = serve(bridge(json!({"plug_on": false}), log.clone())).await;
        let device = BridgeConnector::new(&format!("{}/", url), Duration::from_secs(2))
            .connect()
            .await
            .unwrap();

        device.write("plug_on", &ChannelValue::Bool(true)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![json!({"field": "plug_on", "value": true})]);

        let err = device
            .write("heater_target_temp", &ChannelValue::Int(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Rejected { .. }));
    }

    #[tokio::test]
    async fn unreachable_bridge_fails_to_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = BridgeConnector::new(&format!("http://{}", addr), Duration::from_secs(1))
            .connect()
            .await;
        assert!(matches!(result, Err(DeviceError::Connect(_))));
    }
}
