//! Peer-side reassembly of chunked bulk syncs.
//!
//! Chunks of one sync attempt may arrive in any order. They are buffered per
//! sync id until the run `0..=last_seq` is complete, then applied to the
//! [`StateStore`] in one pass. A sync that is not complete by its deadline is
//! abandoned and a resync is requested from the controller.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::ReassemblyConfig,
    protocol::{RequestResync, SyncDescriptor, SyncId, TypedMessage},
    records::{watermark, ApiSessionRecord, SessionRecord},
    state::{PendingCallbacks, ReconcileSummary, StateEvent, StateStore},
    transport::ControlChannel,
};

pub const DEADLINE_EXCEEDED_REASON: &str = "timeout, did not receive all updates in time";

/// Records carried by one chunk. A chunk never mixes kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    ApiSessions(Vec<ApiSessionRecord>),
    Sessions(Vec<SessionRecord>),
}

impl ChunkPayload {
    pub fn len(&self) -> usize {
        match self {
            ChunkPayload::ApiSessions(records) => records.len(),
            ChunkPayload::Sessions(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The records of a complete sync, in sequence order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledSync {
    pub api_sessions: Vec<ApiSessionRecord>,
    pub sessions: Vec<SessionRecord>,
}

/// Buffer for one sync attempt.
#[derive(Debug)]
pub struct ReassemblyTracker {
    sync_id: SyncId,
    chunks: BTreeMap<u32, ChunkPayload>,
    has_last: bool,
    last_seq: u32,
    done: bool,
    started_at: Instant,
    // Incremental traffic that arrived while the sync was in flight.
    late_api_sessions: Vec<ApiSessionRecord>,
    late_sessions: Vec<SessionRecord>,
    late_removed_api_sessions: HashSet<String>,
    late_removed_sessions: HashSet<String>,
}

impl ReassemblyTracker {
    pub fn new(sync_id: SyncId) -> Self {
        Self {
            sync_id,
            chunks: BTreeMap::new(),
            has_last: false,
            last_seq: 0,
            done: false,
            started_at: Instant::now(),
            late_api_sessions: Vec::new(),
            late_sessions: Vec::new(),
            late_removed_api_sessions: HashSet::new(),
            late_removed_sessions: HashSet::new(),
        }
    }

    pub fn sync_id(&self) -> SyncId {
        self.sync_id
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn add(&mut self, sequence: u32, is_last: bool, payload: ChunkPayload) {
        if self.chunks.insert(sequence, payload).is_some() {
            debug!(sync_id = %self.sync_id, sequence, "duplicate chunk replaced");
        }
        if is_last {
            self.has_last = true;
            self.last_seq = sequence;
        }
    }

    /// The final chunk has arrived and every sequence before it is present.
    pub fn is_complete(&self) -> bool {
        self.has_last && (0..=self.last_seq).all(|seq| self.chunks.contains_key(&seq))
    }

    pub fn missing_sequences(&self) -> Vec<u32> {
        let upper = if self.has_last {
            self.last_seq
        } else {
            self.chunks.keys().next_back().copied().unwrap_or(0)
        };
        (0..=upper)
            .filter(|seq| !self.chunks.contains_key(seq))
            .collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate the buffered chunks in sequence order.
    pub fn assemble(&self) -> AssembledSync {
        let mut assembled = AssembledSync::default();
        for payload in self.chunks.values() {
            match payload {
                ChunkPayload::ApiSessions(records) => {
                    assembled.api_sessions.extend(records.iter().cloned())
                }
                ChunkPayload::Sessions(records) => assembled.sessions.extend(records.iter().cloned()),
            }
        }
        assembled
    }

    /// Reconcile both tables against the assembled snapshot. One watermark,
    /// the highest id of either kind, guards removals in both tables.
    fn apply(
        &self,
        store: &StateStore,
        pending: &mut PendingCallbacks,
    ) -> (ReconcileSummary, ReconcileSummary) {
        let snapshot = self.assemble();
        let mark = watermark(&snapshot.api_sessions).max(watermark(&snapshot.sessions));

        let mut api_sessions: Vec<ApiSessionRecord> = snapshot
            .api_sessions
            .into_iter()
            .filter(|r| !self.late_removed_api_sessions.contains(&r.token))
            .collect();
        api_sessions.extend(self.late_api_sessions.iter().cloned());

        let mut sessions: Vec<SessionRecord> = snapshot
            .sessions
            .into_iter()
            .filter(|r| !self.late_removed_sessions.contains(&r.token))
            .collect();
        sessions.extend(self.late_sessions.iter().cloned());

        (
            store.reconcile_api_sessions_deferred(&api_sessions, mark, pending),
            store.reconcile_sessions_deferred(&sessions, mark, pending),
        )
    }
}

/// What happened to an inbound chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Opened a new tracker (possibly preempting an older one).
    Started,
    Buffered,
    /// Older than the newest sync seen; dropped.
    Stale,
}

struct ActiveSync {
    tracker: ReassemblyTracker,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ReceiverState {
    current: Option<ActiveSync>,
    newest_seen: Option<SyncId>,
}

/// Owns the tracker for one control channel and applies completed syncs.
pub struct SyncReceiver {
    store: Arc<StateStore>,
    control: Arc<dyn ControlChannel>,
    config: ReassemblyConfig,
    state: Mutex<ReceiverState>,
}

impl SyncReceiver {
    pub fn new(
        store: Arc<StateStore>,
        control: Arc<dyn ControlChannel>,
        config: ReassemblyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            control,
            config,
            state: Mutex::new(ReceiverState::default()),
        })
    }

    pub fn receive_chunk(
        self: &Arc<Self>,
        descriptor: SyncDescriptor,
        payload: ChunkPayload,
    ) -> ChunkOutcome {
        let mut state = self.state.lock();

        let in_flight = state
            .current
            .as_ref()
            .filter(|active| !active.tracker.is_done())
            .map(|active| active.tracker.sync_id());

        let outcome = match in_flight {
            Some(current) if descriptor.id < current => ChunkOutcome::Stale,
            Some(current) if descriptor.id == current => ChunkOutcome::Buffered,
            Some(_) => ChunkOutcome::Started,
            None if state.newest_seen.is_some_and(|newest| descriptor.id <= newest) => {
                ChunkOutcome::Stale
            }
            None => ChunkOutcome::Started,
        };

        match outcome {
            ChunkOutcome::Stale => {
                warn!(
                    sync_id = %descriptor.id,
                    sequence = descriptor.sequence,
                    "discarding chunk from stale sync"
                );
                return outcome;
            }
            ChunkOutcome::Started => {
                if let Some(old) = state.current.take() {
                    if !old.tracker.is_done() {
                        info!(
                            old_sync_id = %old.tracker.sync_id(),
                            new_sync_id = %descriptor.id,
                            "newer sync preempts in-flight sync"
                        );
                        self.store.mark_sync_stopped(old.tracker.sync_id());
                    }
                    old.cancel.cancel();
                }
                let cancel = CancellationToken::new();
                state.current = Some(ActiveSync {
                    tracker: ReassemblyTracker::new(descriptor.id),
                    cancel: cancel.clone(),
                });
                state.newest_seen = Some(descriptor.id);
                self.store.mark_sync_in_progress(descriptor.id);
                self.spawn_watchdog(descriptor.id, cancel);
            }
            ChunkOutcome::Buffered => {}
        }

        if let Some(active) = state.current.as_mut() {
            debug!(
                sync_id = %descriptor.id,
                sequence = descriptor.sequence,
                is_last = descriptor.is_last,
                records = payload.len(),
                "buffered sync chunk"
            );
            active
                .tracker
                .add(descriptor.sequence, descriptor.is_last, payload);
        }
        outcome
    }

    /// Record incremental ApiSession upserts so an in-flight sync keeps them.
    pub fn note_api_sessions_added(&self, records: &[ApiSessionRecord]) {
        if let Some(tracker) = self.in_flight(&mut self.state.lock()) {
            for record in records {
                tracker.late_removed_api_sessions.remove(&record.token);
            }
            tracker.late_api_sessions.extend(records.iter().cloned());
        }
    }

    pub fn note_api_sessions_removed(&self, tokens: &[String]) {
        if let Some(tracker) = self.in_flight(&mut self.state.lock()) {
            tracker
                .late_api_sessions
                .retain(|r| !tokens.contains(&r.token));
            tracker
                .late_removed_api_sessions
                .extend(tokens.iter().cloned());
        }
    }

    pub fn note_sessions_added(&self, records: &[SessionRecord]) {
        if let Some(tracker) = self.in_flight(&mut self.state.lock()) {
            for record in records {
                tracker.late_removed_sessions.remove(&record.token);
            }
            tracker.late_sessions.extend(records.iter().cloned());
        }
    }

    pub fn note_sessions_removed(&self, tokens: &[String]) {
        if let Some(tracker) = self.in_flight(&mut self.state.lock()) {
            tracker.late_sessions.retain(|r| !tokens.contains(&r.token));
            tracker.late_removed_sessions.extend(tokens.iter().cloned());
        }
    }

    /// Apply a headerless full state: upsert, then delete everything absent.
    pub fn apply_legacy_api_sessions(&self, records: &[ApiSessionRecord]) -> ReconcileSummary {
        let mut pending = PendingCallbacks::default();
        let summary = {
            let _guard = self.state.lock();
            self.store
                .reconcile_api_sessions_deferred(records, None, &mut pending)
        };
        pending.run();
        info!(upserted = summary.upserted, removed = summary.removed, "applied legacy api session state");
        summary
    }

    pub fn apply_legacy_sessions(&self, records: &[SessionRecord]) -> ReconcileSummary {
        let mut pending = PendingCallbacks::default();
        let summary = {
            let _guard = self.state.lock();
            self.store
                .reconcile_sessions_deferred(records, None, &mut pending)
        };
        pending.run();
        info!(upserted = summary.upserted, removed = summary.removed, "applied legacy session state");
        summary
    }

    /// Id and completion flag of the current tracker, if any.
    pub fn current_sync(&self) -> Option<(SyncId, bool)> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|active| (active.tracker.sync_id(), active.tracker.is_done()))
    }

    pub fn missing_sequences(&self) -> Vec<u32> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|active| active.tracker.missing_sequences())
            .unwrap_or_default()
    }

    /// Cancel any in-flight tracker without applying it.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Some(active) = state.current.take() {
            active.cancel.cancel();
            self.store.mark_sync_stopped(active.tracker.sync_id());
        }
    }

    fn in_flight<'a>(&self, state: &'a mut ReceiverState) -> Option<&'a mut ReassemblyTracker> {
        state
            .current
            .as_mut()
            .map(|active| &mut active.tracker)
            .filter(|tracker| !tracker.is_done())
    }

    fn spawn_watchdog(self: &Arc<Self>, sync_id: SyncId, cancel: CancellationToken) {
        let receiver = self.clone();
        let deadline = self.config.deadline();
        let poll_every = self.config.poll_interval();
        let span = info_span!("sync_reassembly", sync_id = %sync_id);

        tokio::spawn(
            async move {
                let deadline = sleep(deadline);
                tokio::pin!(deadline);
                let mut poll = interval(poll_every);
                poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!("sync tracker cancelled");
                            return;
                        }
                        _ = poll.tick() => {
                            if receiver.try_complete(sync_id) {
                                return;
                            }
                        }
                        _ = &mut deadline => {
                            receiver.fail(sync_id, DEADLINE_EXCEEDED_REASON).await;
                            return;
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Apply the sync if it is complete. Returns `true` once there is nothing
    /// left for the watchdog to do.
    ///
    /// Removal callbacks run after the receiver lock is released.
    fn try_complete(&self, sync_id: SyncId) -> bool {
        let mut pending = PendingCallbacks::default();
        let done = self.apply_if_complete(sync_id, &mut pending);
        if !pending.is_empty() {
            let ran = pending.run();
            debug!(sync_id = %sync_id, callbacks = ran, "ran removal callbacks");
        }
        done
    }

    fn apply_if_complete(&self, sync_id: SyncId, pending: &mut PendingCallbacks) -> bool {
        let mut state = self.state.lock();
        let Some(active) = state.current.as_mut() else {
            return true;
        };
        if active.tracker.sync_id() != sync_id || active.tracker.is_done() {
            return true;
        }
        if !active.tracker.is_complete() {
            return false;
        }

        let (api, sessions) = active.tracker.apply(&self.store, pending);
        active.tracker.done = true;
        let elapsed = active.tracker.started_at.elapsed();
        let records = api.upserted + sessions.upserted;

        self.store.mark_sync_stopped(sync_id);
        self.store
            .publish(StateEvent::SyncCompleted { sync_id, records });
        info!(
            sync_id = %sync_id,
            api_sessions = api.upserted,
            api_sessions_removed = api.removed,
            sessions = sessions.upserted,
            sessions_removed = sessions.removed,
            elapsed_ms = elapsed.as_millis() as u64,
            "bulk sync applied"
        );
        true
    }

    async fn fail(&self, sync_id: SyncId, reason: &str) {
        {
            let mut state = self.state.lock();
            let is_current = state
                .current
                .as_ref()
                .is_some_and(|a| a.tracker.sync_id() == sync_id && !a.tracker.is_done());
            if !is_current {
                return;
            }
            if let Some(active) = state.current.take() {
                error!(
                    sync_id = %sync_id,
                    missing = ?active.tracker.missing_sequences(),
                    received = active.tracker.chunk_count(),
                    "bulk sync incomplete at deadline"
                );
            }
        }

        self.store.mark_sync_stopped(sync_id);
        self.store.publish(StateEvent::SyncFailed {
            sync_id,
            reason: reason.to_string(),
        });
        self.request_resync(reason).await;
    }

    async fn request_resync(&self, reason: &str) {
        let request = RequestResync {
            reason: format!("error during api session sync: {}", reason),
        };
        let msg = match request.to_message() {
            Ok(msg) => msg,
            Err(e) => {
                error!(error = %e, "failed to encode resync request");
                return;
            }
        };
        if let Err(e) = self.control.send(msg).await {
            error!(error = %e, "failed to send resync request");
        }
    }
}
