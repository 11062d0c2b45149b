//! Replicated session records.
//!
//! Records are created and destroyed only by the controller. Ids increase
//! monotonically and act as the reconciliation watermark.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Common view over replicated records used by reconciliation.
pub trait Record: Clone + Send + Sync + 'static {
    /// Unique key within the record type
    fn token(&self) -> &str;

    /// Monotonic id assigned by the controller
    fn id(&self) -> u64;
}

/// An authenticated end-user session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSessionRecord {
    pub id: u64,
    pub token: String,
    pub identity_id: String,
    pub cert_fingerprints: BTreeSet<String>,
    pub last_activity_at: DateTime<Utc>,
}

impl ApiSessionRecord {
    pub fn new(id: u64, token: impl Into<String>, identity_id: impl Into<String>) -> Self {
        Self {
            id,
            token: token.into(),
            identity_id: identity_id.into(),
            cert_fingerprints: BTreeSet::new(),
            last_activity_at: Utc::now(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.cert_fingerprints.insert(fingerprint.into());
        self
    }
}

impl Record for ApiSessionRecord {
    fn token(&self) -> &str {
        &self.token
    }

    fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    Dial,
    Bind,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionType::Dial => write!(f, "dial"),
            SessionType::Bind => write!(f, "bind"),
        }
    }
}

/// A service-scoped dial or bind authorization nested under an ApiSession.
///
/// Certificate fingerprints are not carried here; they are resolved through
/// the owning ApiSession when a session is validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: u64,
    pub token: String,
    pub api_session_id: u64,
    pub service_id: String,
    pub identity_id: String,
    pub session_type: SessionType,
}

impl SessionRecord {
    pub fn new(
        id: u64,
        token: impl Into<String>,
        api_session_id: u64,
        service_id: impl Into<String>,
        identity_id: impl Into<String>,
        session_type: SessionType,
    ) -> Self {
        Self {
            id,
            token: token.into(),
            api_session_id,
            service_id: service_id.into(),
            identity_id: identity_id.into(),
            session_type,
        }
    }
}

impl Record for SessionRecord {
    fn token(&self) -> &str {
        &self.token
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Highest id in `records`, or `None` when empty.
pub fn watermark<'a, R: Record>(records: impl IntoIterator<Item = &'a R>) -> Option<u64> {
    records.into_iter().map(Record::id).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark() {
        let records = vec![
            ApiSessionRecord::new(3, "a", "id-1"),
            ApiSessionRecord::new(9, "b", "id-1"),
            ApiSessionRecord::new(4, "c", "id-2"),
        ];
        assert_eq!(watermark(&records), Some(9));
        assert_eq!(watermark::<ApiSessionRecord>(&[]), None);
    }

    #[test]
    fn test_fingerprints_are_a_set() {
        let record = ApiSessionRecord::new(1, "tok", "ident")
            .with_fingerprint("ab:cd")
            .with_fingerprint("ab:cd")
            .with_fingerprint("ef:01");
        assert_eq!(record.cert_fingerprints.len(), 2);
    }
}
