//! Message Router.
//!
//! Consumes [`SessionEvent`]s in wire order on a single task and dispatches
//! each envelope by kind: handshake kinds to the negotiator, content kinds
//! through decryption into storage, everything else to the application
//! unchanged. No error stops the router.

use crate::crypto::cipher;
use crate::crypto::keystore::KeyStore;
use crate::session::negotiator::Negotiator;
use crate::storage::{apply_self_destruct, MessageRecord, MessageStore, SelfDestructScheduler};
use crate::transport::protocol::{ConnectionState, Envelope, MessageKind};
use crate::transport::session::{Outbound, SessionEvent};
use crate::utils::Result;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Event delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The connection state changed
    ConnectionChanged(ConnectionState),
    /// A chat key is now shared with `peer_id`
    ChannelEstablished {
        /// Remote identity
        peer_id: String,
        /// Chat the key belongs to
        chat_id: String,
    },
    /// A content message arrived
    Message(InboundMessage),
    /// An envelope of a kind the core does not interpret
    Unhandled(Envelope),
}

/// Content message as seen by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Id of the stored record, `None` if persisting failed
    pub record_id: Option<Uuid>,
    /// Conversation
    pub chat_id: String,
    /// Author
    pub sender_id: String,
    /// Message kind
    pub kind: MessageKind,
    /// Plaintext, or the wire content when it could not be decrypted
    pub content: Option<String>,
    /// Unix time in milliseconds, as sent
    pub timestamp: i64,
    /// False when `content` is still the ciphertext
    pub decrypted: bool,
    /// Seconds until the record self-destructs
    pub ttl_seconds: Option<u64>,
}

impl InboundMessage {
    fn from_record(record: &MessageRecord, decrypted: bool) -> Self {
        Self {
            record_id: None,
            chat_id: record.chat_id.clone(),
            sender_id: record.sender_id.clone(),
            kind: record.kind.clone(),
            content: record.content.clone(),
            timestamp: record.timestamp,
            decrypted,
            ttl_seconds: record.ttl_seconds,
        }
    }
}

/// Dispatches inbound envelopes
pub struct MessageRouter {
    keys: Arc<KeyStore>,
    negotiator: Arc<Mutex<Negotiator>>,
    outbound: Outbound,
    store: Arc<dyn MessageStore>,
    scheduler: SelfDestructScheduler,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl MessageRouter {
    /// Create a router
    pub fn new(
        keys: Arc<KeyStore>,
        negotiator: Arc<Mutex<Negotiator>>,
        outbound: Outbound,
        store: Arc<dyn MessageStore>,
        scheduler: SelfDestructScheduler,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Self {
        Self {
            keys,
            negotiator,
            outbound,
            store,
            scheduler,
            events,
        }
    }

    /// Process session events until the session side goes away
    pub async fn run(self, mut session_events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = session_events.recv().await {
            self.handle(event).await;
        }
        log::debug!("Message router stopped");
    }

    /// Process one session event
    pub async fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::Opened => self.on_opened().await,
            SessionEvent::StateChanged(state) => {
                if state != ConnectionState::Connected {
                    self.negotiate(|n| {
                        n.on_disconnected();
                        Ok(())
                    })
                    .unwrap_or_default();
                }
                self.emit(ChatEvent::ConnectionChanged(state));
            }
            SessionEvent::Envelope(envelope) => self.route(envelope).await,
        }
    }

    async fn on_opened(&self) {
        match self.negotiate(Negotiator::on_connected) {
            Ok(broadcast) => self.send_all(vec![broadcast]).await,
            Err(e) => log::warn!("Cannot announce public key: {}", e),
        }
    }

    async fn route(&self, envelope: Envelope) {
        let kind = envelope.kind.clone();
        match kind {
            MessageKind::KeyExchange => {
                match self.negotiate(|n| n.handle_key_exchange(&envelope)) {
                    Ok(replies) => self.send_all(replies).await,
                    Err(e) => log::warn!("Key exchange from {} failed: {}", envelope.sender_id, e),
                }
            }
            MessageKind::SecureChannelInit => {
                match self.negotiate(|n| n.handle_channel_init(&envelope)) {
                    Ok(Some(chat_id)) => self.emit(ChatEvent::ChannelEstablished {
                        peer_id: envelope.sender_id,
                        chat_id,
                    }),
                    Ok(None) => {}
                    Err(e) => log::warn!("Channel init from {} failed: {}", envelope.sender_id, e),
                }
            }
            MessageKind::Text
            | MessageKind::Image
            | MessageKind::Video
            | MessageKind::File
            | MessageKind::Audio => self.deliver(envelope, false),
            MessageKind::SelfDestruct => self.deliver(envelope, true),
            MessageKind::Other(name) => {
                log::debug!("Passing {} from {} to the application", name, envelope.sender_id);
                self.emit(ChatEvent::Unhandled(envelope));
            }
        }
    }

    fn deliver(&self, envelope: Envelope, self_destruct: bool) {
        let resolved = self
            .negotiate(|n| Ok(n.local_id().to_string()))
            .and_then(|local_id| envelope.chat_id_for(&local_id));
        let chat_id = match resolved {
            Ok(chat_id) => chat_id,
            Err(e) => {
                log::warn!("Dropping {} from {}: {}", envelope.kind, envelope.sender_id, e);
                return;
            }
        };
        let (content, decrypted) = self.open(&chat_id, envelope.content);

        if decrypted {
            let confirmed = self
                .negotiate(|n| Ok(n.mark_confirmed(&chat_id)))
                .unwrap_or_default();
            if confirmed {
                self.emit(ChatEvent::ChannelEstablished {
                    peer_id: envelope.sender_id.clone(),
                    chat_id: chat_id.clone(),
                });
            }
        }

        let mut record = MessageRecord::new(
            chat_id,
            envelope.sender_id,
            envelope.kind,
            content,
            envelope.timestamp,
        );
        if self_destruct {
            apply_self_destruct(&mut record);
        }

        let mut message = InboundMessage::from_record(&record, decrypted);
        let stored = if self_destruct {
            self.scheduler.schedule(record)
        } else {
            self.store.insert(record)
        };
        match stored {
            Ok(id) => message.record_id = Some(id),
            Err(e) => log::warn!("Could not persist message in {}: {}", message.chat_id, e),
        }

        self.emit(ChatEvent::Message(message));
    }

    /// Decrypt wire content, falling back to the content as received
    fn open(&self, chat_id: &str, content: Option<String>) -> (Option<String>, bool) {
        let Some(content) = content else {
            return (None, false);
        };

        match self.keys.chat_key(chat_id) {
            Ok(Some(key)) => match cipher::decrypt_from_base64(&content, &key) {
                Ok(plaintext) => (Some(plaintext), true),
                Err(e) => {
                    log::warn!("Delivering undecrypted message in {}: {}", chat_id, e);
                    (Some(content), false)
                }
            },
            Ok(None) => {
                log::warn!("No chat key for {}, delivering undecrypted message", chat_id);
                (Some(content), false)
            }
            Err(e) => {
                log::warn!("Chat key lookup for {} failed: {}", chat_id, e);
                (Some(content), false)
            }
        }
    }

    fn negotiate<T>(&self, f: impl FnOnce(&mut Negotiator) -> Result<T>) -> Result<T> {
        let mut negotiator = self.negotiator.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut negotiator)
    }

    async fn send_all(&self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            if let Err(e) = self.outbound.send(&envelope).await {
                log::warn!("Could not send {} to {:?}: {}", envelope.kind, envelope.receiver_id, e);
            }
        }
    }

    fn emit(&self, event: ChatEvent) {
        if self.events.send(event).is_err() {
            log::debug!("No application listener for chat events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::ChatKey;
    use crate::crypto::identity::MemoryKeyStorage;
    use crate::storage::MemoryMessageStore;
    use crate::transport::connector::{Connector, InboundFrame};
    use crate::transport::memory::MemoryHub;
    use crate::transport::session::TransportSession;
    use crate::utils::{ReconnectConfig, TransportConfig};
    use futures::StreamExt;
    use std::time::Duration;

    const CHAT: &str = "direct:alice:bob";

    struct Fixture {
        router: MessageRouter,
        keys: Arc<KeyStore>,
        store: Arc<MemoryMessageStore>,
        events: mpsc::UnboundedReceiver<ChatEvent>,
        session: TransportSession,
    }

    fn fixture(hub: &MemoryHub) -> Fixture {
        let keys = Arc::new(KeyStore::new(Arc::new(MemoryKeyStorage::new())));
        let negotiator = Arc::new(Mutex::new(Negotiator::new("alice", Arc::clone(&keys))));
        let store = Arc::new(MemoryMessageStore::new());
        let (session, _) = TransportSession::new(
            Arc::new(hub.connector()),
            &TransportConfig::default(),
            &ReconnectConfig::default(),
        );
        let (sender, events) = mpsc::unbounded_channel();
        let router = MessageRouter::new(
            Arc::clone(&keys),
            negotiator,
            session.outbound(),
            store.clone(),
            SelfDestructScheduler::new(store.clone()),
            sender,
        );
        Fixture {
            router,
            keys,
            store,
            events,
            session,
        }
    }

    fn from_bob(kind: MessageKind, content: Option<String>) -> Envelope {
        Envelope::new("bob", "alice", CHAT, kind, content)
    }

    fn next_message(events: &mut mpsc::UnboundedReceiver<ChatEvent>) -> InboundMessage {
        loop {
            match events.try_recv() {
                Ok(ChatEvent::Message(message)) => return message,
                Ok(_) => continue,
                Err(e) => panic!("no message event: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_content_is_decrypted_and_stored() {
        let hub = MemoryHub::new();
        let mut f = fixture(&hub);
        let key = ChatKey::generate();
        f.keys.store_chat_key(CHAT, key.clone()).unwrap();

        let sealed = cipher::encrypt_to_base64("hi bob", &key).unwrap();
        f.router
            .handle(SessionEvent::Envelope(from_bob(MessageKind::Text, Some(sealed))))
            .await;

        let message = next_message(&mut f.events);
        assert!(message.decrypted);
        assert_eq!(message.content.as_deref(), Some("hi bob"));

        let stored = f.store.messages_for_chat(CHAT).unwrap();
        assert_eq!(Some(stored[0].id), message.record_id);
        assert_eq!(stored[0].content.as_deref(), Some("hi bob"));
    }

    #[tokio::test]
    async fn test_wrong_key_passes_content_through() {
        let hub = MemoryHub::new();
        let mut f = fixture(&hub);
        f.keys.store_chat_key(CHAT, ChatKey::generate()).unwrap();

        let sealed = cipher::encrypt_to_base64("secret", &ChatKey::generate()).unwrap();
        f.router
            .handle(SessionEvent::Envelope(from_bob(MessageKind::Image, Some(sealed.clone()))))
            .await;

        let message = next_message(&mut f.events);
        assert!(!message.decrypted);
        assert_eq!(message.content, Some(sealed));
        assert_eq!(message.kind, MessageKind::Image);
    }

    #[tokio::test]
    async fn test_message_for_foreign_chat_is_dropped() {
        let hub = MemoryHub::new();
        let mut f = fixture(&hub);
        let key = ChatKey::generate();
        f.keys.store_chat_key(CHAT, key.clone()).unwrap();

        let sealed = cipher::encrypt_to_base64("not from bob", &key).unwrap();
        let forged = Envelope::new("aaron", "alice", CHAT, MessageKind::Text, Some(sealed));
        f.router.handle(SessionEvent::Envelope(forged)).await;

        assert!(f.events.try_recv().is_err());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_forwarded_unchanged() {
        let hub = MemoryHub::new();
        let mut f = fixture(&hub);
        let typing = from_bob(MessageKind::Other("TYPING".to_string()), None);

        f.router.handle(SessionEvent::Envelope(typing.clone())).await;

        assert_eq!(f.events.try_recv().unwrap(), ChatEvent::Unhandled(typing));
        assert!(f.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_destruct_message_expires() {
        let hub = MemoryHub::new();
        let mut f = fixture(&hub);
        let key = ChatKey::generate();
        f.keys.store_chat_key(CHAT, key.clone()).unwrap();

        let sealed = cipher::encrypt_to_base64("burn|2", &key).unwrap();
        f.router
            .handle(SessionEvent::Envelope(from_bob(MessageKind::SelfDestruct, Some(sealed))))
            .await;

        let message = next_message(&mut f.events);
        assert_eq!(message.content.as_deref(), Some("burn"));
        assert_eq!(message.ttl_seconds, Some(2));
        assert_eq!(f.store.len(), 1);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_still_delivers() {
        let hub = MemoryHub::new();
        let mut f = fixture(&hub);
        f.store.set_available(false);

        f.router
            .handle(SessionEvent::Envelope(from_bob(MessageKind::Text, Some("AAAA".to_string()))))
            .await;

        let message = next_message(&mut f.events);
        assert_eq!(message.record_id, None);
        assert!(!message.decrypted);
    }

    #[tokio::test]
    async fn test_open_connection_broadcasts_public_key() {
        let hub = MemoryHub::new();
        let mut f = fixture(&hub);
        let mut bob = hub.connector().connect("bob").await.unwrap();

        f.session.connect("alice");
        let mut states = f.session.subscribe_state();
        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        f.router.handle(SessionEvent::Opened).await;

        let frame = match bob.stream.next().await.unwrap().unwrap() {
            InboundFrame::Text(frame) => frame,
            other => panic!("unexpected frame {other:?}"),
        };
        let envelope = Envelope::from_json(&frame, 1024).unwrap();
        assert_eq!(envelope.kind, MessageKind::KeyExchange);
        assert!(envelope.is_broadcast());
        assert_eq!(
            envelope.content,
            Some(f.keys.get_or_create_identity_key().unwrap().to_base64())
        );

        f.router
            .handle(SessionEvent::StateChanged(ConnectionState::Disconnected))
            .await;
        assert_eq!(
            f.events.try_recv().unwrap(),
            ChatEvent::ConnectionChanged(ConnectionState::Disconnected)
        );
    }
}
