//! Data connections held open under an ApiSession token.

use std::collections::HashMap;

use dashmap::DashMap;

pub(crate) type Cleanup = Box<dyn FnOnce() + Send + Sync + 'static>;

#[derive(Default)]
pub struct ConnectionTracker {
    connections: DashMap<String, HashMap<String, Cleanup>>,
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("tokens", &self.connections.len())
            .finish()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `token` active without attaching a connection.
    pub fn mark_connected(&self, token: &str) {
        self.connections.entry(token.to_string()).or_default();
    }

    /// Track `connection_id` under `token`. `cleanup` runs if the token is
    /// revoked while the connection is still tracked.
    pub fn add(
        &self,
        token: &str,
        connection_id: impl Into<String>,
        cleanup: impl FnOnce() + Send + Sync + 'static,
    ) {
        self.connections
            .entry(token.to_string())
            .or_default()
            .insert(connection_id.into(), Box::new(cleanup));
    }

    /// Forget a connection that closed on its own. Its cleanup is not run.
    pub fn remove(&self, token: &str, connection_id: &str) -> bool {
        let removed = self
            .connections
            .get_mut(token)
            .map(|mut conns| conns.remove(connection_id).is_some())
            .unwrap_or(false);
        self.connections
            .remove_if(token, |_, conns| conns.is_empty());
        removed
    }

    /// Stop tracking `token` and run the cleanup of each of its connections.
    pub fn close_all(&self, token: &str) -> usize {
        let cleanups = self.take(token);
        let count = cleanups.len();
        for cleanup in cleanups {
            cleanup();
        }
        count
    }

    /// Stop tracking `token` and hand back its cleanups unrun.
    pub(crate) fn take(&self, token: &str) -> Vec<Cleanup> {
        self.connections
            .remove(token)
            .map(|(_, conns)| conns.into_values().collect())
            .unwrap_or_default()
    }

    pub fn active_tokens(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_active(&self, token: &str) -> bool {
        self.connections.contains_key(token)
    }

    pub fn connection_count(&self, token: &str) -> usize {
        self.connections.get(token).map(|c| c.len()).unwrap_or(0)
    }
}
