//! Client facade and component wiring.
//!
//! [`ChatClient`] owns one local identity: its key store, the negotiator,
//! the transport session and the router task. The host application talks to
//! it through async calls and a stream of [`ChatEvent`]s.

use crate::crypto::cipher;
use crate::crypto::identity::{IdentityKey, SecureKeyStorage};
use crate::crypto::keystore::KeyStore;
use crate::router::{ChatEvent, MessageRouter};
use crate::session::negotiator::{ChannelState, Negotiator};
use crate::storage::{
    apply_self_destruct, format_self_destruct, MessageRecord, MessageStore, SelfDestructScheduler,
};
use crate::transport::connector::Connector;
use crate::transport::protocol::{
    derive_chat_id, validate_identity, ConnectionState, Envelope, MessageKind,
};
use crate::transport::session::{Outbound, TransportSession};
use crate::utils::{ChatConfig, ConfigError, CryptoError, ProtocolError, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Secure chat client for one local identity
pub struct ChatClient {
    identity: String,
    keys: Arc<KeyStore>,
    negotiator: Arc<Mutex<Negotiator>>,
    session: TransportSession,
    outbound: Outbound,
    store: Arc<dyn MessageStore>,
    scheduler: SelfDestructScheduler,
    events: Option<mpsc::UnboundedReceiver<ChatEvent>>,
    router: JoinHandle<()>,
}

impl ChatClient {
    /// Wire the components and start the router task
    ///
    /// The identity key is fetched or created right away so a broken key
    /// storage is reported here rather than on the first connect.
    pub async fn new(
        config: ChatConfig,
        identity: impl Into<String>,
        key_storage: Arc<dyn SecureKeyStorage>,
        store: Arc<dyn MessageStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = identity.into();
        if let Err(reason) = validate_identity(&identity) {
            log::error!("Invalid local identity: {}", reason);
            return Err(ConfigError::InvalidValue {
                field: "identity".to_string(),
                value: identity,
            }
            .into());
        }

        let keys = Arc::new(KeyStore::new(key_storage));
        let identity_key = keys.get_or_create_identity_key()?;
        log::info!("Chat client for {} ({})", identity, identity_key.fingerprint());

        let negotiator = Arc::new(Mutex::new(Negotiator::new(identity.clone(), Arc::clone(&keys))));
        let (session, session_events) =
            TransportSession::new(connector, &config.transport, &config.reconnect);
        let outbound = session.outbound();
        let scheduler = SelfDestructScheduler::new(Arc::clone(&store));

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let router = MessageRouter::new(
            Arc::clone(&keys),
            Arc::clone(&negotiator),
            outbound.clone(),
            Arc::clone(&store),
            scheduler.clone(),
            event_sender,
        );
        let router = tokio::spawn(router.run(session_events));

        Ok(Self {
            identity,
            keys,
            negotiator,
            session,
            outbound,
            store,
            scheduler,
            events: Some(event_receiver),
            router,
        })
    }

    /// Local identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Public half of the local identity key
    pub fn identity_key(&self) -> Result<IdentityKey> {
        self.keys.get_or_create_identity_key()
    }

    /// Receiver of chat events; `None` once taken
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ChatEvent>> {
        self.events.take()
    }

    /// Open the connection and keep it alive until [`Self::disconnect`]
    pub fn connect(&self) {
        self.session.connect(&self.identity);
    }

    /// Close the connection and stop reconnecting
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.subscribe_state()
    }

    /// Chat-id of the conversation with `peer_id`
    pub fn chat_id_with(&self, peer_id: &str) -> String {
        derive_chat_id(&self.identity, peer_id)
    }

    /// Handshake state of the conversation with `peer_id`
    pub fn channel_state(&self, peer_id: &str) -> ChannelState {
        let chat_id = self.chat_id_with(peer_id);
        self.lock_negotiator().state(&chat_id)
    }

    /// Encrypt and send `text` to `peer_id`
    ///
    /// The outbound record is persisted before sending. Returns its id.
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyNotAvailable` while no chat key exists; a channel
    ///   request is sent to the peer so a later retry can succeed
    /// - `StorageError` if the record cannot be persisted; nothing is sent
    /// - `TransportError` if the connection is closed or down
    pub async fn send_message(&self, peer_id: &str, kind: MessageKind, text: &str) -> Result<Uuid> {
        if !kind.is_content() {
            return Err(ProtocolError::InvalidEnvelope {
                reason: format!("{kind} cannot be sent as a message"),
            }
            .into());
        }

        validate_identity(peer_id).map_err(|reason| ProtocolError::InvalidEnvelope {
            reason: format!("peer {reason}"),
        })?;

        let chat_id = self.chat_id_with(peer_id);
        let Some(key) = self.keys.chat_key(&chat_id)? else {
            self.request_channel(peer_id).await?;
            return Err(CryptoError::KeyNotAvailable {
                reason: format!("no secure channel with {peer_id} yet"),
            }
            .into());
        };

        let sealed = cipher::encrypt_to_base64(text, &key)?;
        let envelope = Envelope::new(&self.identity, peer_id, &chat_id, kind.clone(), Some(sealed));

        let mut record = MessageRecord::new(
            chat_id,
            &self.identity,
            kind.clone(),
            Some(text.to_string()),
            envelope.timestamp,
        )
        .outgoing();
        let id = if kind == MessageKind::SelfDestruct {
            apply_self_destruct(&mut record);
            self.scheduler.schedule(record)?
        } else {
            self.store.insert(record)?
        };

        self.outbound.send(&envelope).await?;
        log::debug!("Sent {} {} to {}", kind, id, peer_id);
        Ok(id)
    }

    /// Send a message that both sides delete after `ttl_seconds`
    pub async fn send_self_destruct(&self, peer_id: &str, payload: &str, ttl_seconds: u64) -> Result<Uuid> {
        let content = format_self_destruct(payload, ttl_seconds)?;
        self.send_message(peer_id, MessageKind::SelfDestruct, &content)
            .await
    }

    /// Stored messages of `chat_id`
    pub fn messages(&self, chat_id: &str) -> Result<Vec<MessageRecord>> {
        self.store.messages_for_chat(chat_id)
    }

    /// Disconnect, cancel self-destruct timers and stop the router
    pub async fn shutdown(self) {
        log::info!("Shutting down chat client for {}", self.identity);
        self.session.disconnect().await;
        self.scheduler.shutdown();
    }

    async fn request_channel(&self, peer_id: &str) -> Result<()> {
        let requests = self.lock_negotiator().request_channel(peer_id)?;
        for envelope in requests {
            if let Err(e) = self.outbound.send(&envelope).await {
                log::debug!("Channel request to {} not sent: {}", peer_id, e);
            }
        }
        Ok(())
    }

    fn lock_negotiator(&self) -> std::sync::MutexGuard<'_, Negotiator> {
        self.negotiator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.router.abort();
    }
}
