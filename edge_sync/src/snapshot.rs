//! Durable session storage, as seen by the controller.
//!
//! Bulk sync and heartbeat validation only need a consistent read view
//! with id cursors and point lookups. Calls are blocking and run off the
//! async executor.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::records::{ApiSessionRecord, SessionRecord};

pub trait SessionStore: Send + Sync + 'static {
    /// Open a read view fixed at one point in time.
    fn snapshot(&self) -> anyhow::Result<Box<dyn SessionSnapshot>>;

    /// Record activity for the given ApiSession tokens. Unknown tokens are ignored.
    fn mark_activity(&self, tokens: &[String], at: DateTime<Utc>) -> anyhow::Result<()>;
}

/// A consistent read view. Loads may still fail per record.
pub trait SessionSnapshot: Send {
    fn api_session_ids(&self) -> Vec<u64>;

    fn load_api_session(&self, id: u64) -> anyhow::Result<ApiSessionRecord>;

    fn session_ids(&self) -> Vec<u64>;

    fn load_session(&self, id: u64) -> anyhow::Result<SessionRecord>;

    fn contains_api_session(&self, token: &str) -> bool;

    fn contains_session(&self, token: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
struct Tables {
    api_sessions: BTreeMap<u64, ApiSessionRecord>,
    api_session_ids: HashMap<String, u64>,
    sessions: BTreeMap<u64, SessionRecord>,
    session_ids: HashMap<String, u64>,
}

/// In-memory [`SessionStore`]. Snapshots are copies of the tables taken
/// under the read lock.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next monotonic record id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn insert_api_session(&self, record: ApiSessionRecord) -> ApiSessionRecord {
        self.bump_ids(record.id);
        let mut tables = self.tables.write();
        if let Some(old) = tables.api_session_ids.insert(record.token.clone(), record.id) {
            tables.api_sessions.remove(&old);
        }
        tables.api_sessions.insert(record.id, record.clone());
        record
    }

    pub fn remove_api_session(&self, token: &str) -> Option<ApiSessionRecord> {
        let mut tables = self.tables.write();
        let id = tables.api_session_ids.remove(token)?;
        tables.api_sessions.remove(&id)
    }

    pub fn insert_session(&self, record: SessionRecord) -> SessionRecord {
        self.bump_ids(record.id);
        let mut tables = self.tables.write();
        if let Some(old) = tables.session_ids.insert(record.token.clone(), record.id) {
            tables.sessions.remove(&old);
        }
        tables.sessions.insert(record.id, record.clone());
        record
    }

    pub fn remove_session(&self, token: &str) -> Option<SessionRecord> {
        let mut tables = self.tables.write();
        let id = tables.session_ids.remove(token)?;
        tables.sessions.remove(&id)
    }

    pub fn api_session(&self, token: &str) -> Option<ApiSessionRecord> {
        let tables = self.tables.read();
        let id = tables.api_session_ids.get(token)?;
        tables.api_sessions.get(id).cloned()
    }

    pub fn api_session_count(&self) -> usize {
        self.tables.read().api_sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.tables.read().sessions.len()
    }

    fn bump_ids(&self, id: u64) {
        self.next_id.fetch_max(id, Ordering::AcqRel);
    }
}

impl SessionStore for MemorySessionStore {
    fn snapshot(&self) -> anyhow::Result<Box<dyn SessionSnapshot>> {
        let tables = self.tables.read().clone();
        Ok(Box::new(MemorySnapshot {
            tables: Arc::new(tables),
        }))
    }

    fn mark_activity(&self, tokens: &[String], at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut tables = self.tables.write();
        for token in tokens {
            let Some(id) = tables.api_session_ids.get(token).copied() else {
                continue;
            };
            if let Some(record) = tables.api_sessions.get_mut(&id) {
                record.last_activity_at = at;
            }
        }
        Ok(())
    }
}

struct MemorySnapshot {
    tables: Arc<Tables>,
}

impl SessionSnapshot for MemorySnapshot {
    fn api_session_ids(&self) -> Vec<u64> {
        self.tables.api_sessions.keys().copied().collect()
    }

    fn load_api_session(&self, id: u64) -> anyhow::Result<ApiSessionRecord> {
        self.tables
            .api_sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("api session {} not found", id))
    }

    fn session_ids(&self) -> Vec<u64> {
        self.tables.sessions.keys().copied().collect()
    }

    fn load_session(&self, id: u64) -> anyhow::Result<SessionRecord> {
        self.tables
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("session {} not found", id))
    }

    fn contains_api_session(&self, token: &str) -> bool {
        self.tables.api_session_ids.contains_key(token)
    }

    fn contains_session(&self, token: &str) -> bool {
        self.tables.session_ids.contains_key(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::SessionType;

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = MemorySessionStore::new();
        let id = store.next_id();
        store.insert_api_session(ApiSessionRecord::new(id, "tok-1", "ident"));

        let view = store.snapshot().unwrap();
        let later = store.next_id();
        store.insert_api_session(ApiSessionRecord::new(later, "tok-2", "ident"));
        store.remove_api_session("tok-1");

        assert_eq!(view.api_session_ids(), vec![id]);
        assert!(view.contains_api_session("tok-1"));
        assert!(!view.contains_api_session("tok-2"));
        assert_eq!(view.load_api_session(id).unwrap().token, "tok-1");
        assert!(view.load_api_session(later).is_err());
    }

    #[test]
    fn test_ids_are_monotonic_across_explicit_inserts() {
        let store = MemorySessionStore::new();
        store.insert_session(SessionRecord::new(
            40,
            "s-1",
            1,
            "svc",
            "ident",
            SessionType::Dial,
        ));
        assert_eq!(store.next_id(), 41);
    }

    #[test]
    fn test_mark_activity() {
        let store = MemorySessionStore::new();
        store.insert_api_session(ApiSessionRecord::new(1, "tok-1", "ident"));
        let at = Utc::now() + chrono::Duration::seconds(30);
        store
            .mark_activity(&["tok-1".to_string(), "ghost".to_string()], at)
            .unwrap();
        assert_eq!(store.api_session("tok-1").unwrap().last_activity_at, at);
    }
}
