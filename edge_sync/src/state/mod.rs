//! Peer-side mirror of the controller's ApiSession and Session tables.
//!
//! The store is the single synchronization point for everything on the peer
//! that reads or mutates session state: the sync receiver, the incremental
//! message handlers, data-plane connection setup and the heartbeat emitter.
//! One instance is built at startup and shared as `Arc<StateStore>`.

pub mod connections;
pub mod events;
pub mod listeners;

use std::{
    collections::{BTreeSet, HashSet},
    io::Write,
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use self::{connections::Cleanup, listeners::Callback};
pub use self::{
    connections::ConnectionTracker,
    events::{spawn_metrics_recorder, EventBus, StateEvent},
    listeners::{ListenerHandle, TokenListeners},
};
use crate::{
    config::StateConfig,
    protocol::SyncId,
    records::{ApiSessionRecord, Record, SessionRecord},
};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub upserted: usize,
    pub removed: usize,
}

/// Removal callbacks detached from the store but not yet run.
///
/// Callers holding a lock collect removals here and call [`run`] once the
/// lock is released, so callbacks may re-enter whatever the caller guards.
///
/// [`run`]: PendingCallbacks::run
#[derive(Default)]
#[must_use = "pending callbacks only run when run() is called"]
pub(crate) struct PendingCallbacks {
    listeners: Vec<(String, Vec<Callback>)>,
    cleanups: Vec<Cleanup>,
}

impl PendingCallbacks {
    fn listeners(&mut self, token: &str, callbacks: Vec<Callback>) -> usize {
        let count = callbacks.len();
        if count > 0 {
            self.listeners.push((token.to_string(), callbacks));
        }
        count
    }

    fn cleanups(&mut self, cleanups: Vec<Cleanup>) -> usize {
        let count = cleanups.len();
        self.cleanups.extend(cleanups);
        count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.cleanups.is_empty()
    }

    /// Run every collected callback. Returns how many ran.
    pub(crate) fn run(self) -> usize {
        let mut count = self.cleanups.len();
        for cleanup in self.cleanups {
            cleanup();
        }
        for (token, callbacks) in self.listeners {
            count += callbacks.len();
            for callback in callbacks {
                callback(&token);
            }
        }
        count
    }
}

pub struct StateStore {
    config: StateConfig,
    api_sessions: DashMap<String, ApiSessionRecord>,
    api_session_tokens: DashMap<u64, String>,
    sessions: DashMap<String, SessionRecord>,
    api_session_listeners: Arc<TokenListeners>,
    session_listeners: Arc<TokenListeners>,
    recently_removed_sessions: DashMap<String, Instant>,
    connections: ConnectionTracker,
    events: EventBus,
    sync_in_progress: Mutex<Option<SyncId>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("api_sessions", &self.api_sessions.len())
            .field("sessions", &self.sessions.len())
            .field("sync_in_progress", &*self.sync_in_progress.lock())
            .finish()
    }
}

impl StateStore {
    pub fn new(config: StateConfig) -> Arc<Self> {
        let events = EventBus::new(config.event_capacity);
        Arc::new(Self {
            config,
            api_sessions: DashMap::new(),
            api_session_tokens: DashMap::new(),
            sessions: DashMap::new(),
            api_session_listeners: TokenListeners::new(),
            session_listeners: TokenListeners::new(),
            recently_removed_sessions: DashMap::new(),
            connections: ConnectionTracker::new(),
            events,
            sync_in_progress: Mutex::new(None),
        })
    }

    // ---- ApiSessions ----

    /// Insert or replace an ApiSession. Returns `true` if the token was new.
    pub fn add_api_session(&self, record: ApiSessionRecord) -> bool {
        let token = record.token.clone();
        let id = record.id;
        let previous = self.api_sessions.insert(token.clone(), record);
        if let Some(previous) = &previous {
            if previous.id != id {
                self.api_session_tokens.remove(&previous.id);
            }
        }
        self.api_session_tokens.insert(id, token.clone());

        let event = if previous.is_some() {
            StateEvent::ApiSessionUpdated { token, id }
        } else {
            StateEvent::ApiSessionAdded { token, id }
        };
        self.events.publish(event);
        previous.is_none()
    }

    pub fn update_api_session(&self, record: ApiSessionRecord) {
        self.add_api_session(record);
    }

    /// Remove an ApiSession, fire its removal listeners and close every data
    /// connection opened under it.
    pub fn remove_api_session(&self, token: &str) -> Option<ApiSessionRecord> {
        let mut pending = PendingCallbacks::default();
        let removed = self.detach_api_session(token, &mut pending);
        pending.run();
        removed
    }

    fn detach_api_session(
        &self,
        token: &str,
        pending: &mut PendingCallbacks,
    ) -> Option<ApiSessionRecord> {
        let removed = self.api_sessions.remove(token).map(|(_, record)| record);
        if let Some(record) = &removed {
            self.api_session_tokens
                .remove_if(&record.id, |_, indexed| indexed == token);
        }

        let listeners = pending.listeners(token, self.api_session_listeners.take(token));
        let connections = pending.cleanups(self.connections.take(token));
        if removed.is_some() {
            debug!(token = %token, listeners, connections, "removed api session");
            self.events.publish(StateEvent::ApiSessionRemoved {
                token: token.to_string(),
            });
        }
        removed
    }

    pub fn get_api_session(&self, token: &str) -> Option<ApiSessionRecord> {
        self.api_sessions.get(token).map(|r| r.value().clone())
    }

    pub fn get_api_session_by_id(&self, id: u64) -> Option<ApiSessionRecord> {
        let token = self.api_session_tokens.get(&id)?.value().clone();
        self.get_api_session(&token)
    }

    /// Wait for an ApiSession that may still be propagating, polling with
    /// exponential backoff until it appears or `timeout` elapses.
    pub async fn get_api_session_with_timeout(
        &self,
        token: &str,
        timeout: Duration,
    ) -> Option<ApiSessionRecord> {
        self.poll_with_backoff(timeout, || self.get_api_session(token))
            .await
    }

    /// Delete every ApiSession absent from `known` whose id is at or below
    /// `watermark`. Without a watermark every absent record is deleted.
    pub fn remove_missing_api_sessions(
        &self,
        known: &[ApiSessionRecord],
        watermark: Option<u64>,
    ) -> Vec<String> {
        let mut pending = PendingCallbacks::default();
        let stale = self.detach_missing_api_sessions(known, watermark, &mut pending);
        pending.run();
        stale
    }

    fn detach_missing_api_sessions(
        &self,
        known: &[ApiSessionRecord],
        watermark: Option<u64>,
        pending: &mut PendingCallbacks,
    ) -> Vec<String> {
        let local = self.api_sessions.iter().map(|e| e.value().clone());
        let stale = missing_tokens(local, known, watermark);
        for token in &stale {
            self.detach_api_session(token, pending);
        }
        stale
    }

    /// Upsert every record, then remove the missing ones.
    pub fn reconcile_api_sessions(
        &self,
        records: &[ApiSessionRecord],
        watermark: Option<u64>,
    ) -> ReconcileSummary {
        let mut pending = PendingCallbacks::default();
        let summary = self.reconcile_api_sessions_deferred(records, watermark, &mut pending);
        pending.run();
        summary
    }

    /// As [`reconcile_api_sessions`](Self::reconcile_api_sessions), leaving
    /// removal callbacks in `pending`.
    pub(crate) fn reconcile_api_sessions_deferred(
        &self,
        records: &[ApiSessionRecord],
        watermark: Option<u64>,
        pending: &mut PendingCallbacks,
    ) -> ReconcileSummary {
        for record in records {
            self.add_api_session(record.clone());
        }
        let removed = self.detach_missing_api_sessions(records, watermark, pending);
        ReconcileSummary {
            upserted: records.len(),
            removed: removed.len(),
        }
    }

    pub fn api_session_count(&self) -> usize {
        self.api_sessions.len()
    }

    pub fn api_session_tokens(&self) -> Vec<String> {
        self.api_sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Register a one-shot callback for the removal of `token`.
    pub fn add_api_session_removed_listener(
        &self,
        token: &str,
        callback: impl FnOnce(&str) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.api_session_listeners.subscribe(token, callback)
    }

    // ---- Sessions ----

    /// Insert or replace a Session. Returns `true` if the token was new.
    pub fn add_session(&self, record: SessionRecord) -> bool {
        let token = record.token.clone();
        let id = record.id;
        self.recently_removed_sessions.remove(&token);
        let is_new = self.sessions.insert(token.clone(), record).is_none();
        let event = if is_new {
            StateEvent::SessionAdded { token, id }
        } else {
            StateEvent::SessionUpdated { token, id }
        };
        self.events.publish(event);
        is_new
    }

    pub fn update_session(&self, record: SessionRecord) {
        self.add_session(record);
    }

    /// Remove a Session and fire its removal listeners. Only a session that
    /// was present is remembered as recently removed.
    pub fn remove_session(&self, token: &str) -> Option<SessionRecord> {
        let mut pending = PendingCallbacks::default();
        let removed = self.detach_session(token, &mut pending);
        pending.run();
        removed
    }

    fn detach_session(
        &self,
        token: &str,
        pending: &mut PendingCallbacks,
    ) -> Option<SessionRecord> {
        let removed = self.sessions.remove(token).map(|(_, record)| record);
        if removed.is_some() {
            self.recently_removed_sessions
                .insert(token.to_string(), Instant::now());
        }
        let listeners = pending.listeners(token, self.session_listeners.take(token));
        if removed.is_some() {
            debug!(token = %token, listeners, "removed session");
            self.events.publish(StateEvent::SessionRemoved {
                token: token.to_string(),
            });
        }
        removed
    }

    pub fn get_session(&self, token: &str) -> Option<SessionRecord> {
        self.sessions.get(token).map(|r| r.value().clone())
    }

    pub async fn get_session_with_timeout(
        &self,
        token: &str,
        timeout: Duration,
    ) -> Option<SessionRecord> {
        self.poll_with_backoff(timeout, || self.get_session(token))
            .await
    }

    pub fn remove_missing_sessions(
        &self,
        known: &[SessionRecord],
        watermark: Option<u64>,
    ) -> Vec<String> {
        let mut pending = PendingCallbacks::default();
        let stale = self.detach_missing_sessions(known, watermark, &mut pending);
        pending.run();
        stale
    }

    fn detach_missing_sessions(
        &self,
        known: &[SessionRecord],
        watermark: Option<u64>,
        pending: &mut PendingCallbacks,
    ) -> Vec<String> {
        let local = self.sessions.iter().map(|e| e.value().clone());
        let stale = missing_tokens(local, known, watermark);
        for token in &stale {
            self.detach_session(token, pending);
        }
        stale
    }

    pub fn reconcile_sessions(
        &self,
        records: &[SessionRecord],
        watermark: Option<u64>,
    ) -> ReconcileSummary {
        let mut pending = PendingCallbacks::default();
        let summary = self.reconcile_sessions_deferred(records, watermark, &mut pending);
        pending.run();
        summary
    }

    pub(crate) fn reconcile_sessions_deferred(
        &self,
        records: &[SessionRecord],
        watermark: Option<u64>,
        pending: &mut PendingCallbacks,
    ) -> ReconcileSummary {
        for record in records {
            self.add_session(record.clone());
        }
        let removed = self.detach_missing_sessions(records, watermark, pending);
        ReconcileSummary {
            upserted: records.len(),
            removed: removed.len(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Fingerprints a session is bound to, resolved through its ApiSession.
    pub fn session_cert_fingerprints(&self, token: &str) -> Option<BTreeSet<String>> {
        let api_session_id = self.sessions.get(token)?.api_session_id;
        self.get_api_session_by_id(api_session_id)
            .map(|api_session| api_session.cert_fingerprints)
    }

    /// Register a one-shot callback for the removal of session `token`.
    ///
    /// If the session was removed within the recently-removed window the
    /// callback runs before this returns.
    pub fn add_session_removed_listener(
        &self,
        token: &str,
        callback: impl FnOnce(&str) + Send + Sync + 'static,
    ) -> ListenerHandle {
        if self.recently_removed_sessions.contains_key(token) {
            callback(token);
            return ListenerHandle::fired(token);
        }
        let handle = self.session_listeners.subscribe(token, callback);
        // Removal may have raced the subscription.
        if self.recently_removed_sessions.contains_key(token) {
            self.session_listeners.fire(token);
        }
        handle
    }

    /// Session tokens something on this peer is still waiting on.
    pub fn active_session_tokens(&self) -> Vec<String> {
        self.session_listeners.tokens()
    }

    /// Drop recently-removed markers older than the configured TTL.
    pub fn flush_recently_removed(&self) -> usize {
        let ttl = self.config.recently_removed_ttl();
        let before = self.recently_removed_sessions.len();
        self.recently_removed_sessions
            .retain(|_, removed_at| removed_at.elapsed() < ttl);
        before.saturating_sub(self.recently_removed_sessions.len())
    }

    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.flush_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let flushed = store.flush_recently_removed();
                        if flushed > 0 {
                            debug!(flushed, "flushed recently removed sessions");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    // ---- Data connections ----

    pub fn add_connected_api_session(
        &self,
        token: &str,
        connection_id: impl Into<String>,
        cleanup: impl FnOnce() + Send + Sync + 'static,
    ) {
        self.connections.add(token, connection_id, cleanup);
    }

    pub fn mark_connected_api_session(&self, token: &str) {
        self.connections.mark_connected(token);
    }

    pub fn remove_connected_api_session(&self, token: &str, connection_id: &str) -> bool {
        self.connections.remove(token, connection_id)
    }

    /// Tokens with at least one tracked data connection; reported in heartbeats.
    pub fn active_api_session_tokens(&self) -> Vec<String> {
        self.connections.active_tokens()
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    // ---- Events and sync markers ----

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: StateEvent) {
        self.events.publish(event);
    }

    pub fn mark_sync_in_progress(&self, sync_id: SyncId) {
        *self.sync_in_progress.lock() = Some(sync_id);
        info!(sync_id = %sync_id, "bulk sync in progress");
        self.events.publish(StateEvent::SyncStarted { sync_id });
    }

    /// Clear the in-progress marker if it still belongs to `sync_id`.
    pub fn mark_sync_stopped(&self, sync_id: SyncId) {
        let mut current = self.sync_in_progress.lock();
        if *current == Some(sync_id) {
            *current = None;
        }
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.sync_in_progress.lock().is_some()
    }

    /// Write a readable listing of every ApiSession.
    pub fn dump_api_sessions(&self, out: &mut impl Write) -> std::io::Result<()> {
        let mut records: Vec<ApiSessionRecord> =
            self.api_sessions.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.id);

        writeln!(out, "api sessions ({}):", records.len())?;
        for record in records {
            writeln!(
                out,
                "  id={} token={} identity={} last_activity={} fingerprints={} connections={}",
                record.id,
                record.token,
                record.identity_id,
                record.last_activity_at.to_rfc3339(),
                record.cert_fingerprints.len(),
                self.connections.connection_count(&record.token),
            )?;
        }
        Ok(())
    }

    async fn poll_with_backoff<T>(
        &self,
        timeout: Duration,
        mut lookup: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let cap = self.config.read_backoff_cap();
        let mut wait = self.config.read_backoff_start();
        loop {
            if let Some(found) = lookup() {
                return Some(found);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep(wait.min(deadline - now)).await;
            wait = (wait * 2).min(cap);
        }
    }
}

fn missing_tokens<R: Record>(
    local: impl Iterator<Item = R>,
    known: &[R],
    watermark: Option<u64>,
) -> Vec<String> {
    let known: HashSet<&str> = known.iter().map(Record::token).collect();
    local
        .filter(|record| !known.contains(record.token()))
        .filter(|record| watermark.map_or(true, |mark| record.id() <= mark))
        .map(|record| record.token().to_string())
        .collect()
}
