//! Error types for the session synchronization protocol.
//!
//! Covers peer delivery, wire decoding, durable store access and
//! configuration failures.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Peer sender stopped: {0}")]
    SenderStopped(String),

    #[error("Control channel closed: {0}")]
    ChannelClosed(String),

    #[error("Send to '{peer_id}' timed out after {timeout_ms}ms")]
    SendTimeout { peer_id: String, timeout_ms: u64 },

    #[error("Unknown content type: {0}")]
    UnknownContentType(i32),

    #[error("Failed to decode {message}: {reason}")]
    Decode {
        message: &'static str,
        reason: String,
    },

    #[error("Failed to encode {message}: {reason}")]
    Encode {
        message: &'static str,
        reason: String,
    },

    #[error("Malformed sync state header: {0}")]
    MalformedSyncState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the inbound connection should be closed after this error.
    ///
    /// Most decode failures drop the offending message and keep going. A
    /// malformed sync state header, or a bulk-sync body that cannot be read,
    /// leaves the peer unable to reconcile and closes the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::MalformedSyncState(_) => true,
            SyncError::Decode { message, .. } => *message == "ApiSessionAdded",
            _ => false,
        }
    }

    pub(crate) fn decode(message: &'static str, err: impl std::fmt::Display) -> Self {
        SyncError::Decode {
            message,
            reason: err.to_string(),
        }
    }

    pub(crate) fn encode(message: &'static str, err: impl std::fmt::Display) -> Self {
        SyncError::Encode {
            message,
            reason: err.to_string(),
        }
    }
}
