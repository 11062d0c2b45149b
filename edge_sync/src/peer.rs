//! Peer-side handling of controller messages.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing as log;

use crate::{
    config::ReassemblyConfig,
    error::SyncResult,
    protocol::{
        parse_sync_headers, ApiSessionAdded, ApiSessionRemoved, ApiSessionUpdated, ClientHello,
        ContentType, Message, ServerHello, SessionAdded, SessionRemoved, SessionUpdated, SyncMode,
        TypedMessage,
    },
    reassembly::{ChunkPayload, SyncReceiver},
    state::StateStore,
    transport::ControlChannel,
};

pub struct PeerMessageHandler {
    store: Arc<StateStore>,
    control: Arc<dyn ControlChannel>,
    receiver: Arc<SyncReceiver>,
    hello: ClientHello,
}

impl PeerMessageHandler {
    /// `hello` is what this peer reports when the controller greets it.
    pub fn new(
        store: Arc<StateStore>,
        control: Arc<dyn ControlChannel>,
        config: ReassemblyConfig,
        hello: ClientHello,
    ) -> Arc<Self> {
        let receiver = SyncReceiver::new(store.clone(), control.clone(), config);
        Arc::new(Self {
            store,
            control,
            receiver,
            hello,
        })
    }

    pub fn receiver(&self) -> &Arc<SyncReceiver> {
        &self.receiver
    }

    /// Handle `msg` on its own task. Fatal errors close the control channel.
    pub fn dispatch(self: &Arc<Self>, msg: Message) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            let content_type = msg.content_type;
            let Err(e) = handler.handle_message(msg).await else {
                return;
            };
            if e.is_fatal() {
                log::error!(content_type, error = %e, "fatal error handling controller message, closing control channel");
                if let Err(close_err) = handler.control.close().await {
                    log::warn!(error = %close_err, "failed to close control channel");
                }
            } else {
                log::warn!(content_type, error = %e, "dropping controller message");
            }
        })
    }

    pub async fn handle_message(&self, msg: Message) -> SyncResult<()> {
        match msg.kind()? {
            ContentType::ServerHello => self.handle_server_hello(&msg).await,
            ContentType::ApiSessionAdded => self.handle_api_sessions_added(&msg),
            ContentType::ApiSessionUpdated => {
                let updated = ApiSessionUpdated::from_message(&msg)?;
                self.receiver.note_api_sessions_added(&updated.api_sessions);
                for record in updated.api_sessions {
                    self.store.update_api_session(record);
                }
                Ok(())
            }
            ContentType::ApiSessionRemoved => {
                let removed = ApiSessionRemoved::from_message(&msg)?;
                self.receiver.note_api_sessions_removed(&removed.tokens);
                for token in &removed.tokens {
                    self.store.remove_api_session(token);
                }
                Ok(())
            }
            ContentType::SessionAdded => self.handle_sessions_added(&msg),
            ContentType::SessionUpdated => {
                let updated = SessionUpdated::from_message(&msg)?;
                self.receiver.note_sessions_added(&updated.sessions);
                for record in updated.sessions {
                    self.store.update_session(record);
                }
                Ok(())
            }
            ContentType::SessionRemoved => {
                let removed = SessionRemoved::from_message(&msg)?;
                self.receiver.note_sessions_removed(&removed.tokens);
                for token in &removed.tokens {
                    self.store.remove_session(token);
                }
                Ok(())
            }
            other => {
                log::warn!(content_type = %other, "unexpected message from controller, ignoring");
                Ok(())
            }
        }
    }

    async fn handle_server_hello(&self, msg: &Message) -> SyncResult<()> {
        let hello = ServerHello::from_message(msg)?;
        log::info!(controller_version = %hello.version, "received server hello");
        self.control.send(self.hello.to_message()?).await
    }

    fn handle_api_sessions_added(&self, msg: &Message) -> SyncResult<()> {
        let added = ApiSessionAdded::from_message(msg)?;
        if !added.is_full_state {
            self.receiver.note_api_sessions_added(&added.api_sessions);
            for record in added.api_sessions {
                self.store.add_api_session(record);
            }
            return Ok(());
        }

        match parse_sync_headers(msg)? {
            SyncMode::Chunked(descriptor) => {
                self.receiver
                    .receive_chunk(descriptor, ChunkPayload::ApiSessions(added.api_sessions));
            }
            SyncMode::Legacy => {
                self.receiver.apply_legacy_api_sessions(&added.api_sessions);
            }
        }
        Ok(())
    }

    fn handle_sessions_added(&self, msg: &Message) -> SyncResult<()> {
        let added = SessionAdded::from_message(msg)?;
        if !added.is_full_state {
            self.receiver.note_sessions_added(&added.sessions);
            for record in added.sessions {
                self.store.add_session(record);
            }
            return Ok(());
        }

        match parse_sync_headers(msg)? {
            SyncMode::Chunked(descriptor) => {
                self.receiver
                    .receive_chunk(descriptor, ChunkPayload::Sessions(added.sessions));
            }
            SyncMode::Legacy => {
                self.receiver.apply_legacy_sessions(&added.sessions);
            }
        }
        Ok(())
    }
}
