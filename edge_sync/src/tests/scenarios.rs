use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::test_utils::{init_test_logging, peer_hello, MockChannel};
use crate::{
    config::{CoordinatorConfig, HelloRetryConfig, ReassemblyConfig, StateConfig},
    coordinator::{plan_chunks, SyncCoordinator},
    peer::PeerMessageHandler,
    protocol::{
        parse_sync_headers, ApiSessionAdded, ApiSessionHeartbeat, ApiSessionRemoved, Message,
        RequestResync, ServerHello, SessionAdded, SessionRemoved, SyncDescriptor, SyncId, SyncMode,
        TypedMessage, ValidateSessionsRequest,
    },
    reassembly::{ChunkOutcome, ChunkPayload, SyncReceiver, DEADLINE_EXCEEDED_REASON},
    records::{ApiSessionRecord, SessionRecord, SessionType},
    registry::PeerRegistry,
    sender::{PeerConnectionState, PeerSender},
    snapshot::{MemorySessionStore, SessionSnapshot, SessionStore},
    state::{StateEvent, StateStore},
};

// ============================================================================
// Fixtures
// ============================================================================

fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        handshake_workers: 2,
        sync_workers: 2,
        hello_send_timeout_ms: 50,
        chunk_size: 100,
        requeue_interval_ms: 10,
        hello_retry: HelloRetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
        ..Default::default()
    }
}

fn fast_reassembly() -> ReassemblyConfig {
    ReassemblyConfig {
        deadline_secs: 5,
        poll_interval_ms: 10,
    }
}

fn api(id: u64) -> ApiSessionRecord {
    ApiSessionRecord::new(id, format!("api-{id}"), "ident")
}

fn session(id: u64, api_session_id: u64) -> SessionRecord {
    SessionRecord::new(
        id,
        format!("s-{id}"),
        api_session_id,
        "svc",
        "ident",
        SessionType::Dial,
    )
}

fn seeded_store(api_sessions: u64, sessions: u64) -> Arc<MemorySessionStore> {
    let store = Arc::new(MemorySessionStore::new());
    for id in 1..=api_sessions {
        store.insert_api_session(api(id));
    }
    for id in 1..=sessions {
        store.insert_session(session(api_sessions + id, 1));
    }
    store
}

fn coordinator(store: Arc<dyn SessionStore>, config: CoordinatorConfig) -> Arc<SyncCoordinator> {
    SyncCoordinator::new(config, Arc::new(PeerRegistry::new()), store)
}

fn chunk_messages(records: Vec<ApiSessionRecord>, chunk_size: usize) -> Vec<Message> {
    plan_chunks(records, Vec::new(), chunk_size, SyncId::new())
        .iter()
        .map(|chunk| chunk.to_message().unwrap())
        .collect()
}

fn descriptor_of(msg: &Message) -> SyncDescriptor {
    match parse_sync_headers(msg).unwrap() {
        SyncMode::Chunked(descriptor) => descriptor,
        SyncMode::Legacy => panic!("expected a chunked sync message"),
    }
}

/// Poll `condition` until it holds or a few seconds pass.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

async fn wait_for_state(sender: &PeerSender, state: PeerConnectionState) {
    eventually(&format!("{:?}", state), || sender.state() == state).await;
}

/// Hand everything written to `channel` so far to `handler`, in order.
async fn relay(channel: &MockChannel, handler: &PeerMessageHandler) {
    let messages = channel.sent();
    channel.clear();
    for msg in messages {
        handler.handle_message(msg).await.unwrap();
    }
}

/// Store whose first snapshot panics.
struct FlakyStore {
    inner: MemorySessionStore,
    panicked: AtomicBool,
}

impl SessionStore for FlakyStore {
    fn snapshot(&self) -> anyhow::Result<Box<dyn SessionSnapshot>> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("snapshot exploded");
        }
        self.inner.snapshot()
    }

    fn mark_activity(&self, tokens: &[String], at: DateTime<Utc>) -> anyhow::Result<()> {
        self.inner.mark_activity(tokens, at)
    }
}

// ============================================================================
// Controller and peer together
// ============================================================================

#[tokio::test]
async fn test_handshake_then_chunked_sync_end_to_end() {
    init_test_logging();
    let source = seeded_store(250, 30);
    let coordinator = coordinator(source, coordinator_config());
    coordinator.start();

    let to_peer = MockChannel::new("ctrl-er-1");
    let sender = coordinator
        .peer_connected("er-1", to_peer.clone())
        .expect("new peer is registered");
    to_peer.wait_for(1).await;
    wait_for_state(&sender, PeerConnectionState::AwaitingHelloReply).await;
    assert_eq!(to_peer.sent_of::<ServerHello>().len(), 1);

    let peer_store = StateStore::new(StateConfig::default());
    let to_controller = MockChannel::new("er-1-ctrl");
    let handler = PeerMessageHandler::new(
        peer_store.clone(),
        to_controller.clone(),
        fast_reassembly(),
        peer_hello(),
    );
    relay(&to_peer, &handler).await;

    let replies = to_controller.sent();
    assert_eq!(replies.len(), 1);
    for msg in replies {
        coordinator.handle_message("er-1", msg).await.unwrap();
    }
    assert_eq!(sender.info().hostname, "edge-router-1");

    to_peer.wait_for(4).await;
    wait_for_state(&sender, PeerConnectionState::Done).await;
    let chunks = to_peer.sent();
    let shape: Vec<(u32, bool)> = chunks
        .iter()
        .map(|msg| {
            let d = descriptor_of(msg);
            (d.sequence, d.is_last)
        })
        .collect();
    assert_eq!(shape, vec![(0, false), (1, false), (2, false), (3, true)]);

    // Everything but the final chunk, out of order: nothing may be applied.
    for index in [1, 0, 2] {
        handler.handle_message(chunks[index].clone()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(peer_store.api_session_count(), 0);
    assert!(peer_store.is_sync_in_progress());

    handler.handle_message(chunks[3].clone()).await.unwrap();
    eventually("sync applied", || peer_store.session_count() == 30).await;
    assert_eq!(peer_store.api_session_count(), 250);
    assert!(!peer_store.is_sync_in_progress());

    coordinator.stop().await;
}

#[tokio::test]
async fn test_incremental_fan_out_reaches_every_peer() {
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), coordinator_config());
    let first = MockChannel::new("ch-1");
    let second = MockChannel::new("ch-2");
    coordinator.peer_connected("er-1", first.clone()).unwrap();
    coordinator.peer_connected("er-2", second.clone()).unwrap();

    assert_eq!(coordinator.api_session_added(api(7)).await, 2);
    assert_eq!(coordinator.session_deleted("s-9").await, 2);
    for channel in [&first, &second] {
        channel.wait_for(2).await;
        let added: Vec<ApiSessionAdded> = channel.sent_of();
        assert_eq!(added.len(), 1);
        assert!(!added[0].is_full_state);
        assert_eq!(parse_sync_headers(&channel.sent()[0]).unwrap(), SyncMode::Legacy);
        let removed: Vec<SessionRemoved> = channel.sent_of();
        assert_eq!(removed[0].tokens, vec!["s-9".to_string()]);
    }

    coordinator.peer_disconnected("er-2", second.as_ref());
    assert_eq!(coordinator.api_session_deleted("api-7").await, 1);
}

// ============================================================================
// Reassembly on the peer
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_out_of_order_chunks_apply_once_complete() {
    let store = StateStore::new(StateConfig::default());
    let handler = PeerMessageHandler::new(
        store.clone(),
        MockChannel::new("ctrl"),
        ReassemblyConfig::default(),
        peer_hello(),
    );
    let mut events = store.subscribe();

    let chunks = chunk_messages((1..=250).map(api).collect(), 100);
    assert_eq!(chunks.len(), 3);
    handler.handle_message(chunks[1].clone()).await.unwrap();
    handler.handle_message(chunks[0].clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.api_session_count(), 0);
    assert_eq!(handler.receiver().missing_sequences(), Vec::<u32>::new());

    handler.handle_message(chunks[2].clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.api_session_count(), 250);

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if let StateEvent::SyncCompleted { records, .. } = event {
            assert_eq!(records, 250);
            completed += 1;
        }
    }
    assert_eq!(completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_newer_sync_preempts_and_older_is_stale() {
    let store = StateStore::new(StateConfig::default());
    let receiver = SyncReceiver::new(store.clone(), MockChannel::new("ctrl"), ReassemblyConfig::default());
    let mut ids = [SyncId::new(), SyncId::new()];
    ids.sort();
    let [older, newer] = ids;
    assert_ne!(older, newer);

    let first = SyncDescriptor {
        id: older,
        is_last: false,
        sequence: 0,
    };
    assert_eq!(
        receiver.receive_chunk(first, ChunkPayload::ApiSessions(vec![api(1)])),
        ChunkOutcome::Started
    );

    let replacement = SyncDescriptor {
        id: newer,
        is_last: true,
        sequence: 0,
    };
    assert_eq!(
        receiver.receive_chunk(replacement, ChunkPayload::ApiSessions(vec![api(2)])),
        ChunkOutcome::Started
    );
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.api_session_tokens(), vec!["api-2".to_string()]);
    assert_eq!(receiver.current_sync(), Some((newer, true)));

    let late = SyncDescriptor {
        id: older,
        is_last: true,
        sequence: 1,
    };
    assert_eq!(
        receiver.receive_chunk(late, ChunkPayload::ApiSessions(vec![api(3)])),
        ChunkOutcome::Stale
    );
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(store.get_api_session("api-3").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_requests_resync() {
    let store = StateStore::new(StateConfig::default());
    let to_controller = MockChannel::new("ctrl");
    let receiver = SyncReceiver::new(store.clone(), to_controller.clone(), ReassemblyConfig::default());
    let mut events = store.subscribe();

    let sync_id = SyncId::new();
    let descriptor = SyncDescriptor {
        id: sync_id,
        is_last: false,
        sequence: 0,
    };
    receiver.receive_chunk(descriptor, ChunkPayload::ApiSessions(vec![api(1)]));
    assert!(store.is_sync_in_progress());

    tokio::time::sleep(Duration::from_secs(21)).await;
    let requests: Vec<RequestResync> = to_controller.sent_of();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].reason,
        format!("error during api session sync: {}", DEADLINE_EXCEEDED_REASON)
    );
    assert!(!store.is_sync_in_progress());
    assert_eq!(store.api_session_count(), 0);
    assert_eq!(receiver.current_sync(), None);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if let StateEvent::SyncFailed { sync_id: id, .. } = event {
            assert_eq!(id, sync_id);
            failed = true;
        }
    }
    assert!(failed);

    let straggler = SyncDescriptor {
        id: sync_id,
        is_last: true,
        sequence: 1,
    };
    assert_eq!(
        receiver.receive_chunk(straggler, ChunkPayload::ApiSessions(vec![])),
        ChunkOutcome::Stale
    );
}

#[tokio::test(start_paused = true)]
async fn test_watermark_and_late_removal_during_sync() {
    let store = StateStore::new(StateConfig::default());
    let handler = PeerMessageHandler::new(
        store.clone(),
        MockChannel::new("ctrl"),
        ReassemblyConfig::default(),
        peer_hello(),
    );
    // Created on the controller after the snapshot was taken.
    store.add_api_session(api(500));
    // Deleted on the controller before the snapshot.
    store.add_api_session(ApiSessionRecord::new(3, "gone", "ident"));

    let chunks = chunk_messages((1..=150).filter(|id| *id != 3).map(api).collect(), 100);
    handler.handle_message(chunks[0].clone()).await.unwrap();

    let removal = ApiSessionRemoved {
        tokens: vec!["api-5".to_string()],
    };
    handler.handle_message(removal.to_message().unwrap()).await.unwrap();
    handler.handle_message(chunks[1].clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(store.get_api_session("api-500").is_some());
    assert!(store.get_api_session("gone").is_none());
    assert!(store.get_api_session("api-5").is_none());
    assert!(store.get_api_session("api-150").is_some());
    assert_eq!(store.api_session_count(), 149);
}

#[tokio::test]
async fn test_removal_listener_fires_once_across_duplicate_removals() {
    let store = StateStore::new(StateConfig::default());
    let handler = PeerMessageHandler::new(
        store.clone(),
        MockChannel::new("ctrl"),
        ReassemblyConfig::default(),
        peer_hello(),
    );
    store.add_api_session(api(1));

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _handle = store.add_api_session_removed_listener("api-1", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let removal = ApiSessionRemoved {
        tokens: vec!["api-1".to_string()],
    };
    handler.handle_message(removal.to_message().unwrap()).await.unwrap();
    handler.handle_message(removal.to_message().unwrap()).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sync_without_sessions_keeps_newer_local_sessions() {
    let store = StateStore::new(StateConfig::default());
    let handler = PeerMessageHandler::new(
        store.clone(),
        MockChannel::new("ctrl"),
        ReassemblyConfig::default(),
        peer_hello(),
    );
    let added = SessionAdded {
        is_full_state: false,
        sessions: vec![session(1000, 1)],
    };
    handler.handle_message(added.to_message().unwrap()).await.unwrap();

    for msg in chunk_messages((1..=3).map(api).collect(), 100) {
        handler.handle_message(msg).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(store.api_session_count(), 3);
    assert!(store.get_session("s-1000").is_some());
    assert!(!store.is_sync_in_progress());
}

#[tokio::test(start_paused = true)]
async fn test_older_sync_is_dropped_while_newer_is_in_flight() {
    let store = StateStore::new(StateConfig::default());
    let receiver = SyncReceiver::new(store.clone(), MockChannel::new("ctrl"), ReassemblyConfig::default());
    let mut ids = [SyncId::new(), SyncId::new()];
    ids.sort();
    let [older, newer] = ids;

    let opening = SyncDescriptor {
        id: newer,
        is_last: false,
        sequence: 0,
    };
    assert_eq!(
        receiver.receive_chunk(opening, ChunkPayload::ApiSessions(vec![api(1)])),
        ChunkOutcome::Started
    );

    let intruder = SyncDescriptor {
        id: older,
        is_last: true,
        sequence: 0,
    };
    assert_eq!(
        receiver.receive_chunk(intruder, ChunkPayload::ApiSessions(vec![api(9)])),
        ChunkOutcome::Stale
    );
    assert_eq!(receiver.current_sync(), Some((newer, false)));

    let closing = SyncDescriptor {
        id: newer,
        is_last: true,
        sequence: 1,
    };
    assert_eq!(
        receiver.receive_chunk(closing, ChunkPayload::ApiSessions(vec![api(2)])),
        ChunkOutcome::Buffered
    );
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut tokens = store.api_session_tokens();
    tokens.sort();
    assert_eq!(tokens, vec!["api-1".to_string(), "api-2".to_string()]);
    assert_eq!(receiver.current_sync(), Some((newer, true)));
}

#[tokio::test]
async fn test_legacy_session_state_replaces_everything() {
    let store = StateStore::new(StateConfig::default());
    let handler = PeerMessageHandler::new(
        store.clone(),
        MockChannel::new("ctrl"),
        ReassemblyConfig::default(),
        peer_hello(),
    );
    store.add_session(session(5000, 1));
    store.add_session(session(10, 1));

    let full = SessionAdded {
        is_full_state: true,
        sessions: vec![session(10, 1), session(11, 1)],
    };
    handler.handle_message(full.to_message().unwrap()).await.unwrap();

    assert!(store.get_session("s-5000").is_none());
    assert!(store.get_session("s-10").is_some());
    assert!(store.get_session("s-11").is_some());
    assert_eq!(store.session_count(), 2);
    assert_eq!(handler.receiver().current_sync(), None);
}

#[tokio::test(start_paused = true)]
async fn test_removal_listener_may_query_receiver_during_sync() {
    let store = StateStore::new(StateConfig::default());
    let receiver = SyncReceiver::new(store.clone(), MockChannel::new("ctrl"), ReassemblyConfig::default());
    store.add_api_session(api(1));

    let seen = Arc::new(Mutex::new(None));
    let observer = receiver.clone();
    let record = seen.clone();
    let _handle = store.add_api_session_removed_listener("api-1", move |_| {
        *record.lock() = Some(observer.current_sync());
    });

    let sync_id = SyncId::new();
    let descriptor = SyncDescriptor {
        id: sync_id,
        is_last: true,
        sequence: 0,
    };
    receiver.receive_chunk(descriptor, ChunkPayload::ApiSessions(vec![api(2), api(3)]));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(store.get_api_session("api-1").is_none());
    assert_eq!(*seen.lock(), Some(Some((sync_id, true))));
}

// ============================================================================
// Controller lifecycle
// ============================================================================

#[tokio::test]
async fn test_resync_from_unknown_peer_is_ignored() {
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), coordinator_config());
    coordinator.start();
    let request = RequestResync {
        reason: "testing".to_string(),
    };
    coordinator
        .handle_message("ghost", request.to_message().unwrap())
        .await
        .unwrap();
    assert!(coordinator.registry().is_empty());
    coordinator.stop().await;
}

#[tokio::test]
async fn test_hello_retry_gives_up_after_max_attempts() {
    init_test_logging();
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), coordinator_config());
    coordinator.start();
    let channel = MockChannel::new("ch-1");
    channel.stall();

    let sender = coordinator.peer_connected("er-1", channel.clone()).unwrap();
    wait_for_state(&sender, PeerConnectionState::Error).await;
    assert_eq!(sender.hello_attempts(), 3);
    assert!(channel.sent().is_empty());
    coordinator.stop().await;
}

#[tokio::test]
async fn test_hello_retry_recovers() {
    let mut config = coordinator_config();
    config.hello_retry.max_attempts = 10;
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), config);
    coordinator.start();
    let channel = MockChannel::new("ch-1");
    channel.stall();

    let sender = coordinator.peer_connected("er-1", channel.clone()).unwrap();
    wait_for_state(&sender, PeerConnectionState::HandshakeTimeout).await;
    channel.resume();
    wait_for_state(&sender, PeerConnectionState::AwaitingHelloReply).await;
    assert_eq!(channel.sent_of::<ServerHello>().len(), 1);
    assert!(sender.hello_attempts() >= 2);
    coordinator.stop().await;
}

#[tokio::test]
async fn test_late_hello_timeout_does_not_undo_sync() {
    let mut config = coordinator_config();
    config.hello_send_timeout_ms = 300;
    config.hello_retry.max_attempts = 10;
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), config);
    coordinator.start();
    let channel = MockChannel::new("ch-1");
    channel.stall();

    let sender = coordinator.peer_connected("er-1", channel.clone()).unwrap();
    wait_for_state(&sender, PeerConnectionState::HandshakeSent).await;
    coordinator.receive_client_hello("er-1", peer_hello());
    wait_for_state(&sender, PeerConnectionState::Done).await;

    // Outlast the stalled hello's send timeout.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sender.state(), PeerConnectionState::Done);
    assert_eq!(sender.hello_attempts(), 1);

    channel.resume();
    coordinator.stop().await;
}

#[tokio::test]
async fn test_stop_returns_while_sync_waits_on_stalled_peer() {
    let mut config = coordinator_config();
    config.chunk_size = 1;
    config.peer_send_buffer = 1;
    let coordinator = coordinator(seeded_store(50, 0), config);
    coordinator.start();
    let channel = MockChannel::new("ch-1");

    let sender = coordinator.peer_connected("er-1", channel.clone()).unwrap();
    wait_for_state(&sender, PeerConnectionState::AwaitingHelloReply).await;
    channel.stall();
    coordinator.receive_client_hello("er-1", peer_hello());
    wait_for_state(&sender, PeerConnectionState::SyncInProgress).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sender.state(), PeerConnectionState::SyncInProgress);

    let stopped = tokio::time::timeout(Duration::from_secs(3), coordinator.stop()).await;
    assert!(stopped.is_ok(), "stop should not wait for a blocked sync");
    assert!(coordinator.is_stopped());
}

#[tokio::test]
async fn test_closed_channels() {
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), coordinator_config());

    let dead = MockChannel::new("dead");
    dead.close_now();
    assert!(coordinator.peer_connected("er-0", dead).is_none());
    assert!(coordinator.registry().is_empty());

    let channel = MockChannel::new("ch-1");
    let sender = coordinator.peer_connected("er-1", channel.clone()).unwrap();
    channel.close_now();
    coordinator.start();
    wait_for_state(&sender, PeerConnectionState::Disconnected).await;
    coordinator.stop().await;
}

#[tokio::test]
async fn test_duplicate_connect_and_stale_disconnect() {
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), coordinator_config());
    let channel = MockChannel::new("ch-1");
    let original = coordinator.peer_connected("er-1", channel.clone()).unwrap();
    assert!(coordinator.peer_connected("er-1", channel.clone()).is_none());
    assert!(Arc::ptr_eq(&coordinator.registry().get("er-1").unwrap(), &original));

    let reconnect = MockChannel::new("ch-2");
    let replacement = coordinator.peer_connected("er-1", reconnect.clone()).unwrap();
    assert!(original.is_stopped());

    // The old connection going away must not evict the new one.
    coordinator.peer_disconnected("er-1", channel.as_ref());
    assert!(Arc::ptr_eq(&coordinator.registry().get("er-1").unwrap(), &replacement));

    coordinator.peer_disconnected("er-1", reconnect.as_ref());
    assert!(coordinator.registry().get("er-1").is_none());
    assert_eq!(replacement.state(), PeerConnectionState::Disconnected);
    assert!(replacement.is_stopped());
}

#[tokio::test]
async fn test_full_sync_queue_is_retried() {
    let config = CoordinatorConfig {
        sync_queue_size: 1,
        ..coordinator_config()
    };
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), config);
    let first = MockChannel::new("ch-1");
    let second = MockChannel::new("ch-2");
    coordinator.peer_connected("er-1", first.clone()).unwrap();
    coordinator.peer_connected("er-2", second.clone()).unwrap();

    // Both hellos arrive before any worker runs, so the second finds the queue full.
    coordinator.receive_client_hello("er-1", peer_hello());
    coordinator.receive_client_hello("er-2", peer_hello());
    coordinator.start();

    for channel in [&first, &second] {
        eventually("bulk sync delivered", || {
            channel
                .sent_of::<ApiSessionAdded>()
                .iter()
                .any(|added| added.is_full_state)
        })
        .await;
    }
    coordinator.stop().await;
}

#[tokio::test]
async fn test_panicking_store_does_not_kill_sync_worker() {
    let store = Arc::new(FlakyStore {
        inner: MemorySessionStore::new(),
        panicked: AtomicBool::new(false),
    });
    store.inner.insert_api_session(api(1));
    let config = CoordinatorConfig {
        sync_workers: 1,
        ..coordinator_config()
    };
    let coordinator = coordinator(store, config);
    coordinator.start();

    let channel = MockChannel::new("ch-1");
    let sender = coordinator.peer_connected("er-1", channel.clone()).unwrap();
    wait_for_state(&sender, PeerConnectionState::AwaitingHelloReply).await;

    coordinator.receive_client_hello("er-1", peer_hello());
    wait_for_state(&sender, PeerConnectionState::Error).await;

    let retry = RequestResync {
        reason: "error during api session sync: testing".to_string(),
    };
    coordinator.receive_resync("er-1", retry);
    wait_for_state(&sender, PeerConnectionState::Done).await;
    eventually("chunk delivered", || {
        !channel.sent_of::<ApiSessionAdded>().is_empty()
    })
    .await;
    coordinator.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let coordinator = coordinator(Arc::new(MemorySessionStore::new()), coordinator_config());
    coordinator.start();
    coordinator.start();
    coordinator.stop().await;
    coordinator.stop().await;
    assert!(coordinator.is_stopped());

    // Nothing is queued once stopped.
    let channel = MockChannel::new("ch-1");
    let sender = coordinator.peer_connected("er-1", channel.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sender.state(), PeerConnectionState::Queued);
    assert!(channel.sent().is_empty());
}

// ============================================================================
// Heartbeats and validation
// ============================================================================

#[tokio::test]
async fn test_heartbeat_validation_removes_unknown_tokens() {
    let source = seeded_store(1, 1);
    let before = source.api_session("api-1").unwrap().last_activity_at;
    let coordinator = coordinator(source.clone(), coordinator_config());
    let channel = MockChannel::new("ch-1");
    coordinator.peer_connected("er-1", channel.clone()).unwrap();

    let heartbeat = ApiSessionHeartbeat {
        tokens: vec!["api-1".to_string(), "gone-1".to_string()],
    };
    let missing = coordinator.validate_heartbeat("er-1", heartbeat).await.unwrap();
    assert_eq!(missing, vec!["gone-1".to_string()]);
    channel.wait_for(1).await;
    let removed: Vec<ApiSessionRemoved> = channel.sent_of();
    assert_eq!(removed[0].tokens, vec!["gone-1".to_string()]);
    assert!(source.api_session("api-1").unwrap().last_activity_at >= before);

    let request = ValidateSessionsRequest {
        session_tokens: vec!["s-2".to_string(), "s-404".to_string()],
    };
    coordinator
        .handle_message("er-1", request.to_message().unwrap())
        .await
        .unwrap();
    channel.wait_for(2).await;
    let removed: Vec<SessionRemoved> = channel.sent_of();
    assert_eq!(removed[0].tokens, vec!["s-404".to_string()]);
}

#[tokio::test]
async fn test_heartbeat_from_unknown_peer_is_dropped() {
    let coordinator = coordinator(seeded_store(1, 0), coordinator_config());
    let heartbeat = ApiSessionHeartbeat {
        tokens: vec!["gone".to_string()],
    };
    assert!(coordinator
        .validate_heartbeat("ghost", heartbeat)
        .await
        .unwrap()
        .is_empty());
}
