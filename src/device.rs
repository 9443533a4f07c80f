use async_trait::async_trait;
use heat_protocol::channel::ChannelValue;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Heater,
    Plug,
    Battery,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Heater, DeviceKind::Plug, DeviceKind::Battery];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Heater => "heater",
            DeviceKind::Plug => "plug",
            DeviceKind::Battery => "battery",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed device call. Every variant counts towards the handle's
/// consecutive-failure limit.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{0}")]
    Transient(String),
    #[error("device call timed out")]
    Timeout,
    #[error("empty response")]
    EmptyResponse,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("device rejected {field}: {reason}")]
    Rejected { field: String, reason: String },
}

/// Field name -> value as reported. `None` is a field the device returned as null.
pub type FieldMap = BTreeMap<String, Option<ChannelValue>>;

/// A connected device.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn read(&self) -> Result<FieldMap, DeviceError>;

    async fn write(&self, field: &str, value: &ChannelValue) -> Result<(), DeviceError>;
}

/// Creates device handles. Called again whenever a handle was torn down.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DeviceClient>, DeviceError>;
}
