//! Control channel seam.
//!
//! Framing, dialing and request/reply correlation live behind this trait.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::{SyncError, SyncResult},
    protocol::Message,
};

#[async_trait]
pub trait ControlChannel: Send + Sync + 'static {
    /// Unique id of this connection. A reconnecting peer gets a new one.
    fn id(&self) -> &str;

    fn is_closed(&self) -> bool;

    async fn send(&self, msg: Message) -> SyncResult<()>;

    async fn close(&self) -> SyncResult<()>;

    async fn send_with_timeout(&self, msg: Message, timeout: Duration) -> SyncResult<()> {
        match tokio::time::timeout(timeout, self.send(msg)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::SendTimeout {
                peer_id: self.id().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
