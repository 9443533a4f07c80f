use async_trait::async_trait;
use heat_protocol::channel::Slate;
use heat_protocol::sync::{SyncClient, SyncResponse, TransportError};

/// Sends a slate snapshot and receives the target vector for this cycle.
#[async_trait]
pub trait TargetExchange: Send + Sync {
    async fn exchange(&self, slate: &Slate) -> Result<SyncResponse, TransportError>;
}

#[async_trait]
impl TargetExchange for SyncClient {
    async fn exchange(&self, slate: &Slate) -> Result<SyncResponse, TransportError> {
        SyncClient::exchange(self, slate).await
    }
}
