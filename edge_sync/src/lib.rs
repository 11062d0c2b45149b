//! Controller to edge-node session state synchronization
//!
//! This crate keeps the ApiSession and Session tables of every connected peer
//! consistent with the controller:
//! - Handshake and bulk sync orchestration on the controller
//! - Chunked snapshot delivery with out-of-order reassembly on the peer
//! - Incremental fan-out through ordered per-peer senders
//! - Heartbeat and session validation to reconcile drift

pub mod config;
pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod peer;
pub mod protocol;
pub mod reassembly;
pub mod records;
pub mod registry;
pub mod retry;
pub mod sender;
pub mod snapshot;
pub mod state;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::SyncConfig;
pub use coordinator::{plan_chunks, SyncChunk, SyncCoordinator, SyncReport};
pub use error::{SyncError, SyncResult};
pub use heartbeat::{HeartbeatEmitter, SessionValidator};
pub use peer::PeerMessageHandler;
pub use protocol::{ContentType, Message, SyncDescriptor, SyncId, TypedMessage};
pub use reassembly::{ReassemblyTracker, SyncReceiver};
pub use records::{ApiSessionRecord, SessionRecord, SessionType};
pub use registry::PeerRegistry;
pub use sender::{PeerConnectionState, PeerSender};
pub use snapshot::{MemorySessionStore, SessionSnapshot, SessionStore};
pub use state::{StateEvent, StateStore};
pub use transport::ControlChannel;
