//! Configuration for the sync coordinator, reassembly, heartbeat and state store.
//!
//! All sections are optional in YAML; missing fields fall back to defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{SyncError, SyncResult},
    retry::RetryPolicy,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub reassembly: ReassemblyConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub session_validation: SessionValidationConfig,

    #[serde(default)]
    pub state: StateConfig,
}

/// Controller-side handshake and bulk sync settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Capacity of the queue feeding handshake workers
    #[serde(default = "default_queue_size")]
    pub handshake_queue_size: usize,

    /// Capacity of the queue feeding bulk sync workers
    #[serde(default = "default_queue_size")]
    pub sync_queue_size: usize,

    #[serde(default = "default_workers")]
    pub handshake_workers: usize,

    #[serde(default = "default_workers")]
    pub sync_workers: usize,

    /// Per-peer outbound queue capacity
    #[serde(default = "default_peer_send_buffer")]
    pub peer_send_buffer: usize,

    #[serde(default = "default_hello_send_timeout_ms")]
    pub hello_send_timeout_ms: u64,

    /// Records per bulk sync chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub hello_retry: HelloRetryConfig,

    /// Delay between attempts to enqueue onto a full worker queue
    #[serde(default = "default_requeue_interval_ms")]
    pub requeue_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloRetryConfig {
    #[serde(default = "default_hello_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_hello_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_hello_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Peer-side bulk sync reassembly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Hard deadline for receiving every chunk of one sync (seconds)
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_max_tokens_per_message")]
    pub max_tokens_per_message: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionValidationConfig {
    #[serde(default = "default_validation_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_validation_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_validation_max_interval_ms")]
    pub max_interval_ms: u64,
}

/// Peer-side state store tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// How long a removed session token keeps firing late listeners (seconds)
    #[serde(default = "default_recently_removed_ttl_secs")]
    pub recently_removed_ttl_secs: u64,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_read_backoff_start_ms")]
    pub read_backoff_start_ms: u64,

    #[serde(default = "default_read_backoff_cap_ms")]
    pub read_backoff_cap_ms: u64,

    /// Buffered global events per subscriber before it lags
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_queue_size() -> usize {
    1000
}

fn default_workers() -> usize {
    4
}

fn default_peer_send_buffer() -> usize {
    100
}

fn default_hello_send_timeout_ms() -> u64 {
    10_000
}

fn default_chunk_size() -> usize {
    100
}

fn default_requeue_interval_ms() -> u64 {
    1000
}

fn default_hello_max_attempts() -> u32 {
    5
}

fn default_hello_base_delay_ms() -> u64 {
    500
}

fn default_hello_max_delay_ms() -> u64 {
    30_000
}

fn default_deadline_secs() -> u64 {
    20
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_max_tokens_per_message() -> usize {
    10_000
}

fn default_validation_chunk_size() -> usize {
    1000
}

fn default_validation_min_interval_ms() -> u64 {
    250
}

fn default_validation_max_interval_ms() -> u64 {
    1500
}

fn default_recently_removed_ttl_secs() -> u64 {
    60
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_read_backoff_start_ms() -> u64 {
    1
}

fn default_read_backoff_cap_ms() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            handshake_queue_size: default_queue_size(),
            sync_queue_size: default_queue_size(),
            handshake_workers: default_workers(),
            sync_workers: default_workers(),
            peer_send_buffer: default_peer_send_buffer(),
            hello_send_timeout_ms: default_hello_send_timeout_ms(),
            chunk_size: default_chunk_size(),
            hello_retry: HelloRetryConfig::default(),
            requeue_interval_ms: default_requeue_interval_ms(),
        }
    }
}

impl Default for HelloRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_hello_max_attempts(),
            base_delay_ms: default_hello_base_delay_ms(),
            max_delay_ms: default_hello_max_delay_ms(),
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            max_tokens_per_message: default_max_tokens_per_message(),
        }
    }
}

impl Default for SessionValidationConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_validation_chunk_size(),
            min_interval_ms: default_validation_min_interval_ms(),
            max_interval_ms: default_validation_max_interval_ms(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            recently_removed_ttl_secs: default_recently_removed_ttl_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            read_backoff_start_ms: default_read_backoff_start_ms(),
            read_backoff_cap_ms: default_read_backoff_cap_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(yaml: &str) -> SyncResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_yaml_file(path: &str) -> SyncResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.coordinator.validate()?;
        self.reassembly.validate()?;
        self.heartbeat.validate()?;
        self.session_validation.validate()?;
        self.state.validate()
    }
}

fn require_nonzero(value: usize, name: &str) -> SyncResult<()> {
    if value == 0 {
        return Err(SyncError::Config(format!("{} must be greater than 0", name)));
    }
    Ok(())
}

impl CoordinatorConfig {
    pub fn validate(&self) -> SyncResult<()> {
        require_nonzero(self.handshake_queue_size, "handshake_queue_size")?;
        require_nonzero(self.sync_queue_size, "sync_queue_size")?;
        require_nonzero(self.handshake_workers, "handshake_workers")?;
        require_nonzero(self.sync_workers, "sync_workers")?;
        require_nonzero(self.peer_send_buffer, "peer_send_buffer")?;
        require_nonzero(self.chunk_size, "chunk_size")?;
        if self.hello_retry.base_delay_ms > self.hello_retry.max_delay_ms {
            return Err(SyncError::Config(format!(
                "hello_retry.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.hello_retry.base_delay_ms, self.hello_retry.max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn hello_send_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_send_timeout_ms)
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_millis(self.requeue_interval_ms)
    }

    pub fn hello_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.hello_retry.max_attempts,
            base_delay: Duration::from_millis(self.hello_retry.base_delay_ms),
            max_delay: Duration::from_millis(self.hello_retry.max_delay_ms),
        }
    }
}

impl ReassemblyConfig {
    pub fn validate(&self) -> SyncResult<()> {
        if self.poll_interval() >= self.deadline() {
            return Err(SyncError::Config(format!(
                "reassembly poll_interval_ms ({}) must be shorter than deadline_secs ({})",
                self.poll_interval_ms, self.deadline_secs
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(SyncError::Config(
                "reassembly poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> SyncResult<()> {
        require_nonzero(self.max_tokens_per_message, "max_tokens_per_message")?;
        if self.interval_secs == 0 {
            return Err(SyncError::Config(
                "heartbeat interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SessionValidationConfig {
    pub fn validate(&self) -> SyncResult<()> {
        require_nonzero(self.chunk_size, "session_validation.chunk_size")?;
        if self.min_interval_ms > self.max_interval_ms {
            return Err(SyncError::Config(format!(
                "session_validation min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

impl StateConfig {
    pub fn validate(&self) -> SyncResult<()> {
        require_nonzero(self.event_capacity, "state.event_capacity")?;
        if self.flush_interval_secs == 0 {
            return Err(SyncError::Config(
                "state flush_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.read_backoff_start_ms == 0 || self.read_backoff_start_ms > self.read_backoff_cap_ms
        {
            return Err(SyncError::Config(format!(
                "state read backoff must satisfy 0 < start ({}) <= cap ({})",
                self.read_backoff_start_ms, self.read_backoff_cap_ms
            )));
        }
        Ok(())
    }

    pub fn recently_removed_ttl(&self) -> Duration {
        Duration::from_secs(self.recently_removed_ttl_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn read_backoff_start(&self) -> Duration {
        Duration::from_millis(self.read_backoff_start_ms)
    }

    pub fn read_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.read_backoff_cap_ms)
    }
}
