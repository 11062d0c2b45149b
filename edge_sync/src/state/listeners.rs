//! Per-token one-shot listeners.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use dashmap::DashMap;

pub(crate) type Callback = Box<dyn FnOnce(&str) + Send + Sync + 'static>;

/// Callbacks keyed by token. Firing a token runs each of its callbacks once
/// and forgets them.
#[derive(Default)]
pub struct TokenListeners {
    listeners: DashMap<String, Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for TokenListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenListeners")
            .field("tokens", &self.listeners.len())
            .finish()
    }
}

/// Cancels one registered listener. Dropping the handle leaves the listener in place.
#[derive(Debug)]
#[must_use = "dropping the handle keeps the listener registered; call cancel() to remove it"]
pub struct ListenerHandle {
    registry: Weak<TokenListeners>,
    token: String,
    id: u64,
}

impl ListenerHandle {
    /// A handle that cancels nothing, for listeners that already fired.
    pub(crate) fn fired(token: impl Into<String>) -> Self {
        Self {
            registry: Weak::new(),
            token: token.into(),
            id: 0,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Deregister the listener. Returns `false` if it already fired or was cancelled.
    pub fn cancel(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.unsubscribe(&self.token, self.id),
            None => false,
        }
    }
}

impl TokenListeners {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        self: &Arc<Self>,
        token: impl Into<String>,
        callback: impl FnOnce(&str) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let token = token.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners
            .entry(token.clone())
            .or_default()
            .push((id, Box::new(callback)));
        ListenerHandle {
            registry: Arc::downgrade(self),
            token,
            id,
        }
    }

    fn unsubscribe(&self, token: &str, id: u64) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.listeners.get_mut(token) {
            let before = entry.len();
            entry.retain(|(listener_id, _)| *listener_id != id);
            removed = entry.len() != before;
        }
        self.listeners.remove_if(token, |_, callbacks| callbacks.is_empty());
        removed
    }

    /// Run and deregister every listener for `token`. Returns how many ran.
    pub fn fire(&self, token: &str) -> usize {
        let callbacks = self.take(token);
        let count = callbacks.len();
        for callback in callbacks {
            callback(token);
        }
        count
    }

    /// Deregister every listener for `token` without running them.
    pub(crate) fn take(&self, token: &str) -> Vec<Callback> {
        self.listeners
            .remove(token)
            .map(|(_, callbacks)| callbacks.into_iter().map(|(_, cb)| cb).collect())
            .unwrap_or_default()
    }

    pub fn has_listeners(&self, token: &str) -> bool {
        self.listeners.contains_key(token)
    }

    pub fn listener_count(&self, token: &str) -> usize {
        self.listeners.get(token).map(|e| e.len()).unwrap_or(0)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.listeners.iter().map(|e| e.key().clone()).collect()
    }
}
