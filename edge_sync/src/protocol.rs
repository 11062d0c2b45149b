//! Control-channel messages and bulk sync headers.
//!
//! Message bodies are bincode-encoded payload structs. Bulk sync chunks carry
//! two extra headers: the strategy name and a JSON sync state
//! (`{"id", "isLast", "sequence"}`). Incremental pushes carry neither.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing as log;
use uuid::Uuid;

use crate::{
    error::{SyncError, SyncResult},
    records::{ApiSessionRecord, SessionRecord},
};

pub const SYNC_STRATEGY_TYPE_HEADER: i32 = 1013;
pub const SYNC_STRATEGY_STATE_HEADER: i32 = 1014;

/// The only chunked strategy understood by this crate.
pub const INSTANT_STRATEGY: &str = "instant";

pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ContentType {
    ServerHello = 20000,
    ClientHello = 20001,
    SessionAdded = 20100,
    SessionUpdated = 20101,
    SessionRemoved = 20102,
    ApiSessionAdded = 20200,
    ApiSessionUpdated = 20201,
    ApiSessionRemoved = 20202,
    ApiSessionHeartbeat = 20203,
    RequestResync = 20204,
    ValidateSessionsRequest = 20205,
}

impl ContentType {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn name(self) -> &'static str {
        match self {
            ContentType::ServerHello => "ServerHello",
            ContentType::ClientHello => "ClientHello",
            ContentType::SessionAdded => "SessionAdded",
            ContentType::SessionUpdated => "SessionUpdated",
            ContentType::SessionRemoved => "SessionRemoved",
            ContentType::ApiSessionAdded => "ApiSessionAdded",
            ContentType::ApiSessionUpdated => "ApiSessionUpdated",
            ContentType::ApiSessionRemoved => "ApiSessionRemoved",
            ContentType::ApiSessionHeartbeat => "ApiSessionHeartbeat",
            ContentType::RequestResync => "RequestResync",
            ContentType::ValidateSessionsRequest => "ValidateSessionsRequest",
        }
    }
}

impl TryFrom<i32> for ContentType {
    type Error = SyncError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let content_type = match value {
            20000 => ContentType::ServerHello,
            20001 => ContentType::ClientHello,
            20100 => ContentType::SessionAdded,
            20101 => ContentType::SessionUpdated,
            20102 => ContentType::SessionRemoved,
            20200 => ContentType::ApiSessionAdded,
            20201 => ContentType::ApiSessionUpdated,
            20202 => ContentType::ApiSessionRemoved,
            20203 => ContentType::ApiSessionHeartbeat,
            20204 => ContentType::RequestResync,
            20205 => ContentType::ValidateSessionsRequest,
            other => return Err(SyncError::UnknownContentType(other)),
        };
        Ok(content_type)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A framed control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub content_type: i32,
    pub headers: BTreeMap<i32, Vec<u8>>,
    pub body: Bytes,
}

impl Message {
    pub fn new(content_type: ContentType, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.as_i32(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: i32, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key, value.into());
        self
    }

    pub fn header(&self, key: i32) -> Option<&[u8]> {
        self.headers.get(&key).map(Vec::as_slice)
    }

    pub fn kind(&self) -> SyncResult<ContentType> {
        ContentType::try_from(self.content_type)
    }

    pub fn is(&self, content_type: ContentType) -> bool {
        self.content_type == content_type.as_i32()
    }
}

/// A payload with a fixed content type.
pub trait TypedMessage: Serialize + DeserializeOwned + Sized {
    const CONTENT_TYPE: ContentType;

    fn to_message(&self) -> SyncResult<Message> {
        let body = bincode::serialize(self)
            .map_err(|e| SyncError::encode(Self::CONTENT_TYPE.name(), e))?;
        Ok(Message::new(Self::CONTENT_TYPE, body))
    }

    fn from_message(msg: &Message) -> SyncResult<Self> {
        if !msg.is(Self::CONTENT_TYPE) {
            return Err(SyncError::decode(
                Self::CONTENT_TYPE.name(),
                format!("unexpected content type {}", msg.content_type),
            ));
        }
        bincode::deserialize(&msg.body).map_err(|e| SyncError::decode(Self::CONTENT_TYPE.name(), e))
    }
}

macro_rules! typed_message {
    ($ty:ty, $content_type:expr) => {
        impl TypedMessage for $ty {
            const CONTENT_TYPE: ContentType = $content_type;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub version: String,
    pub hostname: String,
    pub protocols: Vec<String>,
    pub protocol_ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResync {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSessionAdded {
    pub is_full_state: bool,
    pub api_sessions: Vec<ApiSessionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSessionUpdated {
    pub api_sessions: Vec<ApiSessionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSessionRemoved {
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAdded {
    pub is_full_state: bool,
    pub sessions: Vec<SessionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdated {
    pub sessions: Vec<SessionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRemoved {
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSessionHeartbeat {
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateSessionsRequest {
    pub session_tokens: Vec<String>,
}

typed_message!(ServerHello, ContentType::ServerHello);
typed_message!(ClientHello, ContentType::ClientHello);
typed_message!(RequestResync, ContentType::RequestResync);
typed_message!(ApiSessionAdded, ContentType::ApiSessionAdded);
typed_message!(ApiSessionUpdated, ContentType::ApiSessionUpdated);
typed_message!(ApiSessionRemoved, ContentType::ApiSessionRemoved);
typed_message!(SessionAdded, ContentType::SessionAdded);
typed_message!(SessionUpdated, ContentType::SessionUpdated);
typed_message!(SessionRemoved, ContentType::SessionRemoved);
typed_message!(ApiSessionHeartbeat, ContentType::ApiSessionHeartbeat);
typed_message!(ValidateSessionsRequest, ContentType::ValidateSessionsRequest);

/// Identifies one bulk sync attempt. UUIDv7, so ordering follows creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(Uuid);

impl SyncId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-chunk sync state, carried as JSON in [`SYNC_STRATEGY_STATE_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDescriptor {
    pub id: SyncId,
    pub is_last: bool,
    pub sequence: u32,
}

/// How a full-state message should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Headerless full state from an older controller: apply as one complete snapshot.
    Legacy,
    /// One chunk of a tracked bulk sync.
    Chunked(SyncDescriptor),
}

/// Tags `msg` as one chunk of a bulk sync.
pub fn attach_sync_headers(msg: Message, descriptor: &SyncDescriptor) -> SyncResult<Message> {
    let state = serde_json::to_vec(descriptor).map_err(|e| SyncError::encode("sync state", e))?;
    Ok(msg
        .with_header(SYNC_STRATEGY_TYPE_HEADER, INSTANT_STRATEGY.as_bytes().to_vec())
        .with_header(SYNC_STRATEGY_STATE_HEADER, state))
}

/// Reads the sync headers of a full-state message.
///
/// A malformed state header is an error; every other irregularity falls back
/// to [`SyncMode::Legacy`].
pub fn parse_sync_headers(msg: &Message) -> SyncResult<SyncMode> {
    let Some(strategy) = msg.header(SYNC_STRATEGY_TYPE_HEADER) else {
        return Ok(SyncMode::Legacy);
    };
    let strategy = String::from_utf8_lossy(strategy);

    let Some(state) = msg.header(SYNC_STRATEGY_STATE_HEADER) else {
        log::error!(
            strategy = %strategy,
            "sync strategy header present without sync state, applying as legacy full state"
        );
        return Ok(SyncMode::Legacy);
    };

    let descriptor: SyncDescriptor = serde_json::from_slice(state)
        .map_err(|e| SyncError::MalformedSyncState(e.to_string()))?;

    if strategy != INSTANT_STRATEGY {
        log::warn!(strategy = %strategy, "sync strategy is not supported, applying as legacy full state");
        return Ok(SyncMode::Legacy);
    }

    Ok(SyncMode::Chunked(descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_state() -> Message {
        ApiSessionAdded {
            is_full_state: true,
            api_sessions: vec![ApiSessionRecord::new(1, "tok-1", "ident-1")],
        }
        .to_message()
        .unwrap()
    }

    #[test]
    fn test_content_type_mapping() {
        assert_eq!(
            ContentType::try_from(20204).unwrap(),
            ContentType::RequestResync
        );
        assert!(matches!(
            ContentType::try_from(1),
            Err(SyncError::UnknownContentType(1))
        ));
    }

    #[test]
    fn test_typed_message_rejects_wrong_type() {
        let msg = full_state();
        let err = ApiSessionRemoved::from_message(&msg).unwrap_err();
        assert!(matches!(err, SyncError::Decode { message: "ApiSessionRemoved", .. }));
    }

    #[test]
    fn test_truncated_body_is_decode_error() {
        let mut msg = full_state();
        msg.body = msg.body.slice(0..3);
        let err = ApiSessionAdded::from_message(&msg).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sync_state_json_shape() {
        let descriptor = SyncDescriptor {
            id: SyncId::new(),
            is_last: true,
            sequence: 2,
        };
        let json: serde_json::Value = serde_json::to_value(descriptor).unwrap();
        assert_eq!(json["isLast"], true);
        assert_eq!(json["sequence"], 2);
        assert!(json["id"].is_string());
    }

    #[test]
    fn test_headerless_is_legacy() {
        assert_eq!(parse_sync_headers(&full_state()).unwrap(), SyncMode::Legacy);
    }

    #[test]
    fn test_chunk_headers_parse() {
        let descriptor = SyncDescriptor {
            id: SyncId::new(),
            is_last: false,
            sequence: 7,
        };
        let msg = attach_sync_headers(full_state(), &descriptor).unwrap();
        assert_eq!(
            parse_sync_headers(&msg).unwrap(),
            SyncMode::Chunked(descriptor)
        );
    }

    #[test]
    fn test_missing_state_falls_back_to_legacy() {
        let msg = full_state().with_header(SYNC_STRATEGY_TYPE_HEADER, b"instant".to_vec());
        assert_eq!(parse_sync_headers(&msg).unwrap(), SyncMode::Legacy);
    }

    #[test]
    fn test_unknown_strategy_falls_back_to_legacy() {
        let descriptor = SyncDescriptor {
            id: SyncId::new(),
            is_last: true,
            sequence: 0,
        };
        let msg = attach_sync_headers(full_state(), &descriptor)
            .unwrap()
            .with_header(SYNC_STRATEGY_TYPE_HEADER, b"batched".to_vec());
        assert_eq!(parse_sync_headers(&msg).unwrap(), SyncMode::Legacy);
    }

    #[test]
    fn test_malformed_state_is_fatal() {
        let msg = full_state()
            .with_header(SYNC_STRATEGY_TYPE_HEADER, b"instant".to_vec())
            .with_header(SYNC_STRATEGY_STATE_HEADER, b"{not json".to_vec());
        let err = parse_sync_headers(&msg).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sync_ids_are_ordered() {
        let first = SyncId::new();
        let second = SyncId::new();
        assert!(second > first);
    }
}
