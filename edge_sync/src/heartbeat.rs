//! Peer-side liveness reporting and session validation requests.
//!
//! The heartbeat emitter periodically reports the ApiSession tokens that
//! still have data connections, so the controller can answer with removals
//! for any that no longer exist. The session validator asks the controller
//! to confirm a batch of session tokens.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::{
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{HeartbeatConfig, SessionValidationConfig},
    error::{SyncError, SyncResult},
    protocol::{ApiSessionHeartbeat, TypedMessage, ValidateSessionsRequest},
    state::StateStore,
    transport::ControlChannel,
};

/// Split `tokens` into heartbeat messages of at most `max_per_message` tokens.
pub fn heartbeat_batches(tokens: &[String], max_per_message: usize) -> Vec<ApiSessionHeartbeat> {
    tokens
        .chunks(max_per_message.max(1))
        .map(|chunk| ApiSessionHeartbeat {
            tokens: chunk.to_vec(),
        })
        .collect()
}

pub struct HeartbeatEmitter {
    store: Arc<StateStore>,
    control: Arc<dyn ControlChannel>,
    config: HeartbeatConfig,
}

impl HeartbeatEmitter {
    pub fn new(
        store: Arc<StateStore>,
        control: Arc<dyn ControlChannel>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            store,
            control,
            config,
        }
    }

    /// Send one round of heartbeats. Returns the number of messages sent.
    pub async fn emit_once(&self) -> SyncResult<usize> {
        let tokens = self.store.active_api_session_tokens();
        if tokens.is_empty() {
            debug!("no active api sessions, skipping heartbeat");
            return Ok(0);
        }
        if self.control.is_closed() {
            return Err(SyncError::ChannelClosed(self.control.id().to_string()));
        }

        let batches = heartbeat_batches(&tokens, self.config.max_tokens_per_message);
        let count = batches.len();
        for batch in batches {
            self.control.send(batch.to_message()?).await?;
        }
        debug!(tokens = tokens.len(), messages = count, "sent api session heartbeat");
        Ok(count)
    }

    /// Emit every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "starting api session heartbeat");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.emit_once().await {
                            warn!(error = %e, "failed to send api session heartbeat");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("api session heartbeat stopped");
        })
    }
}

pub struct SessionValidator {
    control: Arc<dyn ControlChannel>,
    config: SessionValidationConfig,
}

impl SessionValidator {
    pub fn new(control: Arc<dyn ControlChannel>, config: SessionValidationConfig) -> Self {
        Self { control, config }
    }

    /// Ask the controller to confirm `tokens`, one batch at a time with a
    /// randomized pause between batches. Returns the number of batches sent.
    pub async fn validate(&self, tokens: &[String]) -> SyncResult<usize> {
        let mut sent = 0;
        for (index, chunk) in tokens.chunks(self.config.chunk_size.max(1)).enumerate() {
            if index > 0 {
                sleep(self.pause()).await;
            }
            if self.control.is_closed() {
                return Err(SyncError::ChannelClosed(self.control.id().to_string()));
            }
            let request = ValidateSessionsRequest {
                session_tokens: chunk.to_vec(),
            };
            self.control.send(request.to_message()?).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Validate every session token something on this peer still depends on.
    pub async fn validate_active(&self, store: &StateStore) -> SyncResult<usize> {
        self.validate(&store.active_session_tokens()).await
    }

    fn pause(&self) -> Duration {
        let min = self.config.min_interval_ms;
        let max = self.config.max_interval_ms.max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}
