//! Registry of connected peers and their senders.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::sender::PeerSender;

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<String, Arc<PeerSender>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store and start `sender`. A sender already registered under `peer_id`
    /// is replaced and stopped.
    pub fn add(&self, peer_id: impl Into<String>, sender: Arc<PeerSender>) {
        let peer_id = peer_id.into();
        sender.start();
        if let Some(old) = self.peers.insert(peer_id.clone(), sender) {
            info!(peer_id = %peer_id, "replacing existing peer sender");
            old.stop();
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerSender>> {
        self.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    /// Stop and forget the sender for `peer_id`. Absent ids are a no-op.
    pub fn remove(&self, peer_id: &str) -> Option<Arc<PeerSender>> {
        self.remove_if(peer_id, |_| true)
    }

    /// Like [`remove`](Self::remove), but only if `predicate` accepts the
    /// currently registered sender.
    pub fn remove_if(
        &self,
        peer_id: &str,
        predicate: impl FnOnce(&PeerSender) -> bool,
    ) -> Option<Arc<PeerSender>> {
        let (_, sender) = self
            .peers
            .remove_if(peer_id, |_, sender| predicate(&**sender))?;
        debug!(peer_id = %peer_id, "removed peer sender");
        sender.stop();
        Some(sender)
    }

    /// Point-in-time copy of the registered senders.
    ///
    /// Map shards are released before the copy is returned, so callers can
    /// await on each sender without holding registry locks.
    pub fn snapshot(&self) -> Vec<Arc<PeerSender>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Visit every registered sender. Iterates a snapshot, so `f` may
    /// add or remove peers.
    pub fn range(&self, mut f: impl FnMut(&Arc<PeerSender>)) {
        for sender in self.snapshot() {
            f(&sender);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Stop every sender and clear the registry.
    pub fn clear(&self) {
        let ids: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_utils::MockChannel;

    fn sender(peer: &str, channel: &str) -> Arc<PeerSender> {
        Arc::new(PeerSender::new(peer, MockChannel::new(channel), 8))
    }

    #[tokio::test]
    async fn test_add_starts_and_replace_stops_old() {
        let registry = PeerRegistry::new();
        let first = sender("er-1", "ch-1");
        registry.add("er-1", first.clone());
        assert!(!first.start(), "add should have started the sender");

        let second = sender("er-1", "ch-2");
        registry.add("er-1", second.clone());
        assert!(first.is_stopped());
        assert!(!second.is_stopped());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("er-1").unwrap().channel().id(), "ch-2");
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let registry = PeerRegistry::new();
        assert!(registry.remove("missing").is_none());

        let s = sender("er-1", "ch-1");
        registry.add("er-1", s.clone());
        assert!(registry.remove("er-1").is_some());
        assert!(s.is_stopped());
        assert!(registry.remove("er-1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_if_checks_predicate() {
        let registry = PeerRegistry::new();
        registry.add("er-1", sender("er-1", "ch-1"));
        assert!(registry
            .remove_if("er-1", |s| s.channel().id() == "ch-other")
            .is_none());
        assert!(registry
            .remove_if("er-1", |s| s.channel().id() == "ch-1")
            .is_some());
    }

    #[tokio::test]
    async fn test_range_allows_mutation() {
        let registry = PeerRegistry::new();
        for n in 0..5 {
            let id = format!("er-{n}");
            registry.add(id.clone(), sender(&id, &format!("ch-{n}")));
        }
        let mut seen = 0;
        registry.range(|s| {
            seen += 1;
            registry.remove(s.peer_id());
        });
        assert_eq!(seen, 5);
        assert!(registry.is_empty());
    }
}
