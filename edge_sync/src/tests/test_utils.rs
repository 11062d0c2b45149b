use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    error::{SyncError, SyncResult},
    protocol::{ClientHello, Message, TypedMessage, PROTOCOL_VERSION},
    transport::ControlChannel,
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub(crate) fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

pub(crate) fn peer_hello() -> ClientHello {
    ClientHello {
        version: PROTOCOL_VERSION.to_string(),
        hostname: "edge-router-1".to_string(),
        protocols: vec!["tls".to_string()],
        protocol_ports: vec!["3022".to_string()],
    }
}

/// In-memory control channel that records everything written to it.
///
/// `stall` makes writes hang until `resume`, which is how tests simulate a
/// slow or unresponsive peer.
pub(crate) struct MockChannel {
    id: String,
    closed: AtomicBool,
    sent: Mutex<Vec<Message>>,
    stalled: watch::Sender<bool>,
}

impl MockChannel {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        let (stalled, _) = watch::channel(false);
        Arc::new(Self {
            id: id.to_string(),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            stalled,
        })
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Decoded payloads of every sent message of type `T`, in send order.
    pub(crate) fn sent_of<T: TypedMessage>(&self) -> Vec<T> {
        self.sent
            .lock()
            .iter()
            .filter(|msg| msg.is(T::CONTENT_TYPE))
            .map(|msg| T::from_message(msg).expect("decodable test message"))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Wait until at least `n` messages were written.
    pub(crate) async fn wait_for(&self, n: usize) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while self.sent.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "expected {} messages on {}, got {}",
            n,
            self.id,
            self.sent.lock().len()
        );
    }

    pub(crate) fn close_now(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn stall(&self) {
        self.stalled.send_replace(true);
    }

    pub(crate) fn resume(&self) {
        self.stalled.send_replace(false);
    }
}

#[async_trait]
impl ControlChannel for MockChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send(&self, msg: Message) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::ChannelClosed(self.id.clone()));
        }
        let mut stalled = self.stalled.subscribe();
        if stalled.wait_for(|stalled| !*stalled).await.is_err() {
            return Err(SyncError::ChannelClosed(self.id.clone()));
        }
        if self.is_closed() {
            return Err(SyncError::ChannelClosed(self.id.clone()));
        }
        self.sent.lock().push(msg);
        Ok(())
    }

    async fn close(&self) -> SyncResult<()> {
        self.close_now();
        Ok(())
    }
}
