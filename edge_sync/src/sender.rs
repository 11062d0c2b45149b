//! Per-peer ordered outbound delivery.
//!
//! Callers enqueue onto a bounded queue and a single worker drains it onto the
//! peer's control channel, so messages to one peer go out in enqueue order. A
//! full queue blocks the caller.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use parking_lot::{Mutex, RwLock};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{SyncError, SyncResult},
    protocol::Message,
    transport::ControlChannel,
};

/// Handshake and sync progress of one peer, as driven by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Queued,
    HandshakeSent,
    AwaitingHelloReply,
    HelloWait,
    ResyncWait,
    SyncInProgress,
    Done,
    Disconnected,
    HandshakeTimeout,
    Error,
}

impl PeerConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Error
        )
    }

    /// The peer has answered the server hello or asked for a resync.
    pub fn is_past_handshake(self) -> bool {
        matches!(
            self,
            PeerConnectionState::HelloWait
                | PeerConnectionState::ResyncWait
                | PeerConnectionState::SyncInProgress
                | PeerConnectionState::Done
        )
    }
}

/// What the peer reported about itself in its hello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub version: String,
    pub hostname: String,
    pub protocols: Vec<String>,
    pub protocol_ports: Vec<String>,
}

pub struct PeerSender {
    peer_id: String,
    channel: Arc<dyn ControlChannel>,
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: RwLock<PeerConnectionState>,
    hello_attempts: AtomicU32,
    info: RwLock<PeerInfo>,
}

impl std::fmt::Debug for PeerSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSender")
            .field("peer_id", &self.peer_id)
            .field("channel_id", &self.channel.id())
            .field("state", &*self.state.read())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl PeerSender {
    pub fn new(peer_id: impl Into<String>, channel: Arc<dyn ControlChannel>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            peer_id: peer_id.into(),
            channel,
            tx,
            rx: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            state: RwLock::new(PeerConnectionState::Queued),
            hello_attempts: AtomicU32::new(0),
            info: RwLock::new(PeerInfo::default()),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn channel(&self) -> &Arc<dyn ControlChannel> {
        &self.channel
    }

    /// Enqueue `msg` for delivery, waiting while the queue is full.
    pub async fn send(&self, msg: Message) -> SyncResult<()> {
        if !self.started.load(Ordering::Acquire) || self.is_stopped() {
            return Err(SyncError::SenderStopped(self.peer_id.clone()));
        }
        if self.channel.is_closed() {
            warn!(peer_id = %self.peer_id, "control channel closed, stopping sender");
            self.stop();
            return Err(SyncError::ChannelClosed(self.peer_id.clone()));
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::SenderStopped(self.peer_id.clone())),
            result = self.tx.send(msg) => {
                result.map_err(|_| SyncError::SenderStopped(self.peer_id.clone()))
            }
        }
    }

    /// Launch the delivery worker. Returns `false` if it was already started.
    pub fn start(&self) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let Some(rx) = self.rx.lock().take() else {
            return false;
        };

        let span = info_span!("peer_sender", peer_id = %self.peer_id);
        let handle = tokio::spawn(
            run_worker(self.channel.clone(), rx, self.cancel.clone()).instrument(span),
        );
        *self.worker.lock() = Some(handle);
        true
    }

    /// Signal the worker to exit. Only the first call has any effect; returns
    /// whether this call performed the shutdown.
    pub fn stop(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!(peer_id = %self.peer_id, "stopping peer sender");
        self.cancel.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolves once the sender has been stopped.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn worker_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(false)
    }

    pub fn state(&self) -> PeerConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: PeerConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(peer_id = %self.peer_id, from = ?previous, to = ?state, "peer state changed");
        }
    }

    /// Move to `state` only if `allowed` accepts the current one. Returns
    /// whether the state was changed.
    pub fn set_state_if(
        &self,
        state: PeerConnectionState,
        allowed: impl FnOnce(PeerConnectionState) -> bool,
    ) -> bool {
        let mut current = self.state.write();
        if !allowed(*current) {
            return false;
        }
        let previous = std::mem::replace(&mut *current, state);
        drop(current);
        if previous != state {
            debug!(peer_id = %self.peer_id, from = ?previous, to = ?state, "peer state changed");
        }
        true
    }

    /// Records a hello send and returns the attempt number (1-based).
    pub fn record_hello_attempt(&self) -> u32 {
        self.hello_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn hello_attempts(&self) -> u32 {
        self.hello_attempts.load(Ordering::Acquire)
    }

    pub fn info(&self) -> PeerInfo {
        self.info.read().clone()
    }

    pub fn set_info(&self, info: PeerInfo) {
        *self.info.write() = info;
    }
}

impl Drop for PeerSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    channel: Arc<dyn ControlChannel>,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    debug!("peer sender worker started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some(msg) = next else { break };
                if channel.is_closed() {
                    debug!(content_type = msg.content_type, "control channel closed, dropping message");
                    continue;
                }
                if let Err(e) = channel.send(msg).await {
                    error!(error = %e, "failed to write to control channel, message dropped");
                }
            }
        }
    }
    info!("peer sender worker exited");
}
