//! Controller-side sync orchestration.
//!
//! A newly connected peer gets a [`PeerSender`] and is queued for a hello.
//! A pool of handshake workers sends hellos; once the peer answers (or asks
//! for a resync) it is queued for a pool of sync workers that stream a
//! consistent snapshot of the session tables as sequenced chunks. After that
//! the peer is kept current by incremental fan-out through its sender.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_channel::TrySendError;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::{info_span, Instrument};

use crate::{
    config::CoordinatorConfig,
    error::{SyncError, SyncResult},
    protocol::{
        attach_sync_headers, ApiSessionAdded, ApiSessionHeartbeat, ApiSessionRemoved,
        ApiSessionUpdated, ClientHello, ContentType, Message, RequestResync, ServerHello,
        SessionAdded, SessionRemoved, SessionUpdated, SyncDescriptor, SyncId, TypedMessage,
        ValidateSessionsRequest, PROTOCOL_VERSION,
    },
    reassembly::ChunkPayload,
    records::{ApiSessionRecord, SessionRecord},
    registry::PeerRegistry,
    sender::{PeerConnectionState, PeerInfo, PeerSender},
    snapshot::SessionStore,
    transport::ControlChannel,
};

/// One bulk sync chunk, ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncChunk {
    pub descriptor: SyncDescriptor,
    pub payload: ChunkPayload,
}

impl SyncChunk {
    pub fn to_message(&self) -> SyncResult<Message> {
        let msg = match &self.payload {
            ChunkPayload::ApiSessions(records) => ApiSessionAdded {
                is_full_state: true,
                api_sessions: records.clone(),
            }
            .to_message()?,
            ChunkPayload::Sessions(records) => SessionAdded {
                is_full_state: true,
                sessions: records.clone(),
            }
            .to_message()?,
        };
        attach_sync_headers(msg, &self.descriptor)
    }
}

/// Split a snapshot into chunks of at most `chunk_size` records.
///
/// ApiSessions come first, then Sessions; a chunk never mixes the two.
/// Sequence numbers run across both kinds and only the final chunk is marked
/// last. An empty snapshot still yields one empty, final chunk so the peer
/// can reconcile against it.
pub fn plan_chunks(
    api_sessions: Vec<ApiSessionRecord>,
    sessions: Vec<SessionRecord>,
    chunk_size: usize,
    sync_id: SyncId,
) -> Vec<SyncChunk> {
    let size = chunk_size.max(1);
    let mut payloads: Vec<ChunkPayload> = api_sessions
        .chunks(size)
        .map(|c| ChunkPayload::ApiSessions(c.to_vec()))
        .chain(sessions.chunks(size).map(|c| ChunkPayload::Sessions(c.to_vec())))
        .collect();
    if payloads.is_empty() {
        payloads.push(ChunkPayload::ApiSessions(Vec::new()));
    }

    let last = payloads.len() - 1;
    payloads
        .into_iter()
        .enumerate()
        .map(|(index, payload)| SyncChunk {
            descriptor: SyncDescriptor {
                id: sync_id,
                is_last: index == last,
                sequence: index as u32,
            },
            payload,
        })
        .collect()
}

/// Read every record inside one snapshot. Records that fail to load are
/// logged and skipped.
pub fn collect_snapshot(
    store: &dyn SessionStore,
) -> SyncResult<(Vec<ApiSessionRecord>, Vec<SessionRecord>)> {
    let view = store.snapshot().map_err(SyncError::Store)?;

    let mut api_sessions = Vec::new();
    for id in view.api_session_ids() {
        match view.load_api_session(id) {
            Ok(record) => api_sessions.push(record),
            Err(e) => log::error!(api_session_id = id, error = %e, "skipping api session in sync"),
        }
    }

    let mut sessions = Vec::new();
    for id in view.session_ids() {
        match view.load_session(id) {
            Ok(record) => sessions.push(record),
            Err(e) => log::error!(session_id = id, error = %e, "skipping session in sync"),
        }
    }
    Ok((api_sessions, sessions))
}

/// Hello bookkeeping may only move a peer that is still handshaking.
fn handshaking(state: PeerConnectionState) -> bool {
    !state.is_past_handshake() && !state.is_terminal()
}

/// Result of one completed bulk sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub sync_id: SyncId,
    pub chunks: usize,
    pub api_sessions: usize,
    pub sessions: usize,
}

pub struct SyncCoordinator {
    config: CoordinatorConfig,
    registry: Arc<PeerRegistry>,
    store: Arc<dyn SessionStore>,
    handshake_tx: async_channel::Sender<Arc<PeerSender>>,
    handshake_rx: async_channel::Receiver<Arc<PeerSender>>,
    sync_tx: async_channel::Sender<Arc<PeerSender>>,
    sync_rx: async_channel::Receiver<Arc<PeerSender>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<PeerRegistry>,
        store: Arc<dyn SessionStore>,
    ) -> Arc<Self> {
        let (handshake_tx, handshake_rx) = async_channel::bounded(config.handshake_queue_size.max(1));
        let (sync_tx, sync_rx) = async_channel::bounded(config.sync_queue_size.max(1));
        Arc::new(Self {
            config,
            registry,
            store,
            handshake_tx,
            handshake_rx,
            sync_tx,
            sync_rx,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Launch the handshake and sync worker pools. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut workers = self.workers.lock();
        for worker in 0..self.config.handshake_workers {
            let span = info_span!("handshake_worker", worker);
            workers.push(tokio::spawn(
                self.clone()
                    .run_handshake_worker(self.handshake_rx.clone())
                    .instrument(span),
            ));
        }
        for worker in 0..self.config.sync_workers {
            let span = info_span!("sync_worker", worker);
            workers.push(tokio::spawn(
                self.clone()
                    .run_sync_worker(self.sync_rx.clone())
                    .instrument(span),
            ));
        }
        log::info!(
            handshake_workers = self.config.handshake_workers,
            sync_workers = self.config.sync_workers,
            "sync coordinator started"
        );
    }

    /// Stop all workers and pending requeue tasks, then wait for the workers to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.handshake_tx.close();
        self.sync_tx.close();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                log::warn!(error = %e, "sync coordinator worker ended abnormally");
            }
        }
        log::info!("sync coordinator stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ---- Connection lifecycle ----

    /// Register a newly connected peer and queue its handshake.
    ///
    /// Returns `None` if the channel is already closed or the peer is already
    /// registered on this same channel.
    pub fn peer_connected(
        self: &Arc<Self>,
        peer_id: &str,
        channel: Arc<dyn ControlChannel>,
    ) -> Option<Arc<PeerSender>> {
        if channel.is_closed() {
            log::info!(peer_id = %peer_id, "peer connected on a closed channel, ignoring");
            return None;
        }
        if let Some(existing) = self.registry.get(peer_id) {
            if existing.channel().id() == channel.id() {
                log::debug!(peer_id = %peer_id, "duplicate connect for the same channel, ignoring");
                return None;
            }
        }

        let sender = Arc::new(PeerSender::new(
            peer_id,
            channel,
            self.config.peer_send_buffer,
        ));
        sender.set_state(PeerConnectionState::Queued);
        self.registry.add(peer_id, sender.clone());
        log::info!(peer_id = %peer_id, channel_id = %sender.channel().id(), "peer connected, queueing handshake");
        self.enqueue(&self.handshake_tx, sender.clone(), "handshake");
        Some(sender)
    }

    /// Drop a peer's sender if it belongs to `channel` (or its own channel has closed).
    pub fn peer_disconnected(&self, peer_id: &str, channel: &dyn ControlChannel) {
        let removed = self.registry.remove_if(peer_id, |sender| {
            sender.channel().id() == channel.id() || sender.channel().is_closed()
        });
        match removed {
            Some(sender) => {
                sender.set_state(PeerConnectionState::Disconnected);
                log::info!(peer_id = %peer_id, "peer disconnected");
            }
            None => {
                log::debug!(peer_id = %peer_id, channel_id = %channel.id(), "disconnect for a superseded channel, ignoring");
            }
        }
    }

    // ---- Peer replies ----

    pub fn receive_client_hello(self: &Arc<Self>, peer_id: &str, hello: ClientHello) {
        let Some(sender) = self.registry.get(peer_id) else {
            log::warn!(peer_id = %peer_id, "client hello from untracked peer, ignoring");
            return;
        };
        log::info!(
            peer_id = %peer_id,
            version = %hello.version,
            hostname = %hello.hostname,
            "received client hello, queueing sync"
        );
        sender.set_info(PeerInfo {
            version: hello.version,
            hostname: hello.hostname,
            protocols: hello.protocols,
            protocol_ports: hello.protocol_ports,
        });
        sender.set_state(PeerConnectionState::HelloWait);
        self.enqueue(&self.sync_tx, sender, "sync");
    }

    pub fn receive_resync(self: &Arc<Self>, peer_id: &str, request: RequestResync) {
        let Some(sender) = self.registry.get(peer_id) else {
            log::warn!(peer_id = %peer_id, reason = %request.reason, "resync request from untracked peer, ignoring");
            return;
        };
        log::info!(peer_id = %peer_id, reason = %request.reason, "peer requested resync");
        sender.set_state(PeerConnectionState::ResyncWait);
        self.enqueue(&self.sync_tx, sender, "sync");
    }

    /// Handle a peer message on its own task.
    pub fn dispatch(self: &Arc<Self>, peer_id: &str, msg: Message) -> JoinHandle<()> {
        let coordinator = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = coordinator.handle_message(&peer_id, msg).await {
                log::warn!(peer_id = %peer_id, error = %e, "dropping peer message");
            }
        })
    }

    pub async fn handle_message(self: &Arc<Self>, peer_id: &str, msg: Message) -> SyncResult<()> {
        match msg.kind()? {
            ContentType::ClientHello => {
                self.receive_client_hello(peer_id, ClientHello::from_message(&msg)?);
            }
            ContentType::RequestResync => {
                self.receive_resync(peer_id, RequestResync::from_message(&msg)?);
            }
            ContentType::ApiSessionHeartbeat => {
                self.validate_heartbeat(peer_id, ApiSessionHeartbeat::from_message(&msg)?)
                    .await?;
            }
            ContentType::ValidateSessionsRequest => {
                self.validate_sessions(peer_id, ValidateSessionsRequest::from_message(&msg)?)
                    .await?;
            }
            other => {
                log::warn!(peer_id = %peer_id, content_type = %other, "unexpected message from peer, ignoring");
            }
        }
        Ok(())
    }

    // ---- Queueing ----

    /// Put `sender` on a worker queue. When the queue is full, keep retrying
    /// in the background until it fits, the peer goes away or we stop.
    fn enqueue(
        self: &Arc<Self>,
        queue: &async_channel::Sender<Arc<PeerSender>>,
        sender: Arc<PeerSender>,
        stage: &'static str,
    ) {
        let sender = match queue.try_send(sender) {
            Ok(()) => return,
            Err(TrySendError::Closed(sender)) => {
                log::debug!(peer_id = %sender.peer_id(), stage, "coordinator stopped, not queueing");
                return;
            }
            Err(TrySendError::Full(sender)) => sender,
        };

        log::warn!(peer_id = %sender.peer_id(), stage, "worker queue full, retrying in background");
        let queue = queue.clone();
        let shutdown = self.shutdown.clone();
        let every = self.config.requeue_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = sender.stopped() => return,
                    _ = sleep(every) => {}
                }
                if sender.channel().is_closed() {
                    sender.set_state(PeerConnectionState::Disconnected);
                    return;
                }
                match queue.try_send(sender.clone()) {
                    Ok(()) => return,
                    Err(TrySendError::Full(_)) => continue,
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        });
    }

    // ---- Handshake ----

    async fn run_handshake_worker(self: Arc<Self>, queue: async_channel::Receiver<Arc<PeerSender>>) {
        loop {
            let sender = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Ok(sender) => sender,
                    Err(_) => break,
                },
            };
            let mut job = tokio::spawn(self.clone().send_hello(sender.clone()));
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    job.abort();
                    log::debug!(peer_id = %sender.peer_id(), "handshake job aborted by shutdown");
                    break;
                }
                result = &mut job => {
                    if let Err(e) = result {
                        log::error!(peer_id = %sender.peer_id(), error = %e, "handshake job panicked");
                        sender.set_state(PeerConnectionState::Error);
                    }
                }
            }
        }
        log::debug!("handshake worker exited");
    }

    async fn send_hello(self: Arc<Self>, sender: Arc<PeerSender>) {
        if sender.is_stopped() || sender.channel().is_closed() {
            sender.set_state(PeerConnectionState::Disconnected);
            return;
        }
        if sender.state().is_past_handshake() {
            log::debug!(peer_id = %sender.peer_id(), state = ?sender.state(), "peer already answered, skipping server hello");
            return;
        }

        let attempt = sender.record_hello_attempt();
        if !sender.set_state_if(PeerConnectionState::HandshakeSent, handshaking) {
            return;
        }
        let hello = ServerHello {
            version: PROTOCOL_VERSION.to_string(),
        };
        let msg = match hello.to_message() {
            Ok(msg) => msg,
            Err(e) => {
                log::error!(peer_id = %sender.peer_id(), error = %e, "failed to encode server hello");
                sender.set_state_if(PeerConnectionState::Error, handshaking);
                return;
            }
        };

        // Sent directly: the sender queue may already hold incremental traffic.
        let result = sender
            .channel()
            .send_with_timeout(msg, self.config.hello_send_timeout())
            .await;
        let Err(e) = result else {
            sender.set_state_if(PeerConnectionState::AwaitingHelloReply, handshaking);
            log::debug!(peer_id = %sender.peer_id(), attempt, "server hello sent");
            return;
        };

        if sender.channel().is_closed() {
            log::info!(peer_id = %sender.peer_id(), error = %e, "peer disconnected during handshake");
            sender.set_state(PeerConnectionState::Disconnected);
            return;
        }

        // The client hello may have raced the timeout.
        if !sender.set_state_if(PeerConnectionState::HandshakeTimeout, handshaking) {
            log::debug!(peer_id = %sender.peer_id(), attempt, error = %e, "server hello timed out after peer answered, not retrying");
            return;
        }
        match self.config.hello_retry_policy().next_delay(attempt) {
            Some(delay) => {
                log::warn!(
                    peer_id = %sender.peer_id(),
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "server hello failed, retrying"
                );
                self.schedule_hello_retry(sender, delay);
            }
            None => {
                log::error!(
                    peer_id = %sender.peer_id(),
                    attempts = attempt,
                    error = %e,
                    "server hello failed, giving up"
                );
                sender.set_state_if(PeerConnectionState::Error, handshaking);
            }
        }
    }

    fn schedule_hello_retry(self: &Arc<Self>, sender: Arc<PeerSender>, delay: Duration) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = coordinator.shutdown.cancelled() => return,
                _ = sender.stopped() => return,
                _ = sleep(delay) => {}
            }
            if sender.channel().is_closed() {
                sender.set_state(PeerConnectionState::Disconnected);
                return;
            }
            if sender.state().is_past_handshake() {
                return;
            }
            coordinator.enqueue(&coordinator.handshake_tx, sender, "handshake");
        });
    }

    // ---- Bulk sync ----

    async fn run_sync_worker(self: Arc<Self>, queue: async_channel::Receiver<Arc<PeerSender>>) {
        loop {
            let sender = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Ok(sender) => sender,
                    Err(_) => break,
                },
            };
            let coordinator = self.clone();
            let job_sender = sender.clone();
            let mut job = tokio::spawn(async move { coordinator.synchronize(&job_sender).await });
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    job.abort();
                    log::debug!(peer_id = %sender.peer_id(), "sync job aborted by shutdown");
                    break;
                }
                result = &mut job => result,
            };
            match result {
                Ok(Ok(report)) => {
                    log::debug!(peer_id = %sender.peer_id(), chunks = report.chunks, "sync job finished");
                }
                Ok(Err(e)) => {
                    log::error!(peer_id = %sender.peer_id(), error = %e, "sync job failed");
                }
                Err(e) => {
                    log::error!(peer_id = %sender.peer_id(), error = %e, "sync job panicked");
                    sender.set_state(PeerConnectionState::Error);
                }
            }
        }
        log::debug!("sync worker exited");
    }

    /// Stream a fresh snapshot of the session tables to one peer.
    pub async fn synchronize(&self, sender: &Arc<PeerSender>) -> SyncResult<SyncReport> {
        if sender.channel().is_closed() {
            sender.set_state(PeerConnectionState::Disconnected);
            return Err(SyncError::ChannelClosed(sender.peer_id().to_string()));
        }
        sender.set_state(PeerConnectionState::SyncInProgress);

        let sync_id = SyncId::new();
        let span = info_span!("bulk_sync", peer_id = %sender.peer_id(), sync_id = %sync_id);
        let result = self.stream_snapshot(sender, sync_id).instrument(span).await;
        match &result {
            Ok(report) => {
                sender.set_state(PeerConnectionState::Done);
                metrics::counter!("edge_sync_bulk_syncs_total", "result" => "ok").increment(1);
                log::info!(
                    peer_id = %sender.peer_id(),
                    sync_id = %sync_id,
                    chunks = report.chunks,
                    api_sessions = report.api_sessions,
                    sessions = report.sessions,
                    "bulk sync sent"
                );
            }
            Err(_) if sender.channel().is_closed() => {
                sender.set_state(PeerConnectionState::Disconnected);
            }
            Err(_) => {
                sender.set_state(PeerConnectionState::Error);
                metrics::counter!("edge_sync_bulk_syncs_total", "result" => "error").increment(1);
            }
        }
        result
    }

    async fn stream_snapshot(&self, sender: &PeerSender, sync_id: SyncId) -> SyncResult<SyncReport> {
        let store = self.store.clone();
        let (api_sessions, sessions) = tokio::task::spawn_blocking(move || collect_snapshot(store.as_ref()))
            .await
            .map_err(|e| SyncError::Store(anyhow!("snapshot task failed: {}", e)))??;

        let api_count = api_sessions.len();
        let session_count = sessions.len();
        let chunks = plan_chunks(api_sessions, sessions, self.config.chunk_size, sync_id);
        let chunk_count = chunks.len();

        for chunk in chunks {
            sender.send(chunk.to_message()?).await?;
            metrics::counter!("edge_sync_chunks_sent_total").increment(1);
        }

        Ok(SyncReport {
            sync_id,
            chunks: chunk_count,
            api_sessions: api_count,
            sessions: session_count,
        })
    }

    // ---- Incremental fan-out ----

    pub async fn api_session_added(&self, record: ApiSessionRecord) -> usize {
        self.broadcast(ApiSessionAdded {
            is_full_state: false,
            api_sessions: vec![record],
        })
        .await
    }

    pub async fn api_session_updated(&self, record: ApiSessionRecord) -> usize {
        self.broadcast(ApiSessionUpdated {
            api_sessions: vec![record],
        })
        .await
    }

    pub async fn api_session_deleted(&self, token: &str) -> usize {
        self.broadcast(ApiSessionRemoved {
            tokens: vec![token.to_string()],
        })
        .await
    }

    pub async fn session_added(&self, record: SessionRecord) -> usize {
        self.broadcast(SessionAdded {
            is_full_state: false,
            sessions: vec![record],
        })
        .await
    }

    pub async fn session_updated(&self, record: SessionRecord) -> usize {
        self.broadcast(SessionUpdated {
            sessions: vec![record],
        })
        .await
    }

    pub async fn session_deleted(&self, token: &str) -> usize {
        self.broadcast(SessionRemoved {
            tokens: vec![token.to_string()],
        })
        .await
    }

    /// Queue `payload` to every registered peer. Returns how many accepted it.
    ///
    /// Each send may wait on a full peer queue.
    async fn broadcast<T: TypedMessage>(&self, payload: T) -> usize {
        let msg = match payload.to_message() {
            Ok(msg) => msg,
            Err(e) => {
                log::error!(content_type = %T::CONTENT_TYPE, error = %e, "failed to encode broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        for sender in self.registry.snapshot() {
            match sender.send(msg.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::debug!(peer_id = %sender.peer_id(), content_type = %T::CONTENT_TYPE, error = %e, "broadcast not delivered");
                }
            }
        }
        delivered
    }

    // ---- Validation ----

    /// Check heartbeat tokens against the store, mark the live ones active
    /// and tell the peer to drop the rest. Returns the missing tokens.
    pub async fn validate_heartbeat(
        &self,
        peer_id: &str,
        heartbeat: ApiSessionHeartbeat,
    ) -> SyncResult<Vec<String>> {
        let Some(sender) = self.registry.get(peer_id) else {
            log::warn!(peer_id = %peer_id, "heartbeat from untracked peer, ignoring");
            return Ok(Vec::new());
        };

        let store = self.store.clone();
        let missing = tokio::task::spawn_blocking(move || -> SyncResult<Vec<String>> {
            let view = store.snapshot().map_err(SyncError::Store)?;
            let (found, missing): (Vec<String>, Vec<String>) = heartbeat
                .tokens
                .into_iter()
                .partition(|token| view.contains_api_session(token));
            if !found.is_empty() {
                store
                    .mark_activity(&found, Utc::now())
                    .map_err(SyncError::Store)?;
            }
            Ok(missing)
        })
        .await
        .map_err(|e| SyncError::Store(anyhow!("heartbeat validation task failed: {}", e)))??;

        if !missing.is_empty() {
            log::info!(peer_id = %peer_id, count = missing.len(), "heartbeat reported unknown api sessions");
            let removal = ApiSessionRemoved {
                tokens: missing.clone(),
            };
            sender.send(removal.to_message()?).await?;
        }
        Ok(missing)
    }

    /// Reply with a removal for every session token the store no longer has.
    pub async fn validate_sessions(
        &self,
        peer_id: &str,
        request: ValidateSessionsRequest,
    ) -> SyncResult<Vec<String>> {
        let Some(sender) = self.registry.get(peer_id) else {
            log::warn!(peer_id = %peer_id, "session validation from untracked peer, ignoring");
            return Ok(Vec::new());
        };

        let store = self.store.clone();
        let missing = tokio::task::spawn_blocking(move || -> SyncResult<Vec<String>> {
            let view = store.snapshot().map_err(SyncError::Store)?;
            Ok(request
                .session_tokens
                .into_iter()
                .filter(|token| !view.contains_session(token))
                .collect())
        })
        .await
        .map_err(|e| SyncError::Store(anyhow!("session validation task failed: {}", e)))??;

        if !missing.is_empty() {
            let removal = SessionRemoved {
                tokens: missing.clone(),
            };
            sender.send(removal.to_message()?).await?;
        }
        Ok(missing)
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
