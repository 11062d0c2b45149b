//! Global state change events and the metrics observer.

use std::sync::Arc;

use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::StateStore;
use crate::protocol::SyncId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    ApiSessionAdded { token: String, id: u64 },
    ApiSessionUpdated { token: String, id: u64 },
    ApiSessionRemoved { token: String },
    SessionAdded { token: String, id: u64 },
    SessionUpdated { token: String, id: u64 },
    SessionRemoved { token: String },
    SyncStarted { sync_id: SyncId },
    SyncCompleted { sync_id: SyncId, records: usize },
    SyncFailed { sync_id: SyncId, reason: String },
}

impl StateEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StateEvent::ApiSessionAdded { .. } => "api_session_added",
            StateEvent::ApiSessionUpdated { .. } => "api_session_updated",
            StateEvent::ApiSessionRemoved { .. } => "api_session_removed",
            StateEvent::SessionAdded { .. } => "session_added",
            StateEvent::SessionUpdated { .. } => "session_updated",
            StateEvent::SessionRemoved { .. } => "session_removed",
            StateEvent::SyncStarted { .. } => "sync_started",
            StateEvent::SyncCompleted { .. } => "sync_completed",
            StateEvent::SyncFailed { .. } => "sync_failed",
        }
    }
}

/// Broadcast fan-out of [`StateEvent`]s. Publishing never blocks; slow
/// subscribers observe `Lagged`.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StateEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Record every state event as metrics until `shutdown` fires.
pub fn spawn_metrics_recorder(store: Arc<StateStore>, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => record(&store, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "metrics recorder lagged behind state events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("state metrics recorder stopped");
    })
}

fn record(store: &StateStore, event: &StateEvent) {
    metrics::counter!("edge_sync_state_events_total", "event" => event.kind()).increment(1);
    metrics::gauge!("edge_sync_api_sessions").set(store.api_session_count() as f64);
    metrics::gauge!("edge_sync_sessions").set(store.session_count() as f64);
    if let StateEvent::SyncCompleted { records, .. } = event {
        metrics::histogram!("edge_sync_bulk_sync_records").record(*records as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(StateEvent::ApiSessionRemoved { token: "t".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(StateEvent::SessionAdded {
            token: "s".into(),
            id: 1,
        });
        bus.publish(StateEvent::SessionRemoved { token: "s".into() });
        assert_eq!(rx.recv().await.unwrap().kind(), "session_added");
        assert_eq!(rx.recv().await.unwrap().kind(), "session_removed");
    }

    #[tokio::test]
    async fn test_metrics_recorder_stops_on_shutdown() {
        let store = StateStore::new(Default::default());
        let shutdown = CancellationToken::new();
        let handle = spawn_metrics_recorder(store.clone(), shutdown.clone());
        store.add_api_session(crate::records::ApiSessionRecord::new(1, "tok", "ident"));
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
