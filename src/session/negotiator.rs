//! Secure Channel Negotiator.
//!
//! Per-chat handshake state machine turning two public keys into one shared
//! chat key:
//!
//! ```text
//! NoChannel -> KeySent -> AwaitingPeerKey -> PeerKeyKnown -> ChannelInitSent -> Established
//! ```
//!
//! Both peers may propose a key for the same chat at the same time. Each chat
//! remembers which identity proposed its current key, and a proposal from `P`
//! replaces it unless the current proposer sorts before `P`. The smaller
//! identity's key therefore wins on both sides whatever the delivery order.

use crate::crypto::cipher::ChatKey;
use crate::crypto::keystore::KeyStore;
use crate::transport::protocol::{derive_chat_id, Envelope, BROADCAST};
use crate::utils::{ChatError, CryptoError, ProtocolError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handshake progress of one chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Nothing has happened yet
    NoChannel,
    /// Our public key was broadcast
    KeySent,
    /// We want to talk to the peer but lack its public key
    AwaitingPeerKey,
    /// The peer's public key is known, no chat key yet
    PeerKeyKnown,
    /// We proposed a chat key and wait for the peer to use it
    ChannelInitSent,
    /// Both sides hold the chat key
    Established,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoChannel => "no channel",
            Self::KeySent => "key sent",
            Self::AwaitingPeerKey => "awaiting peer key",
            Self::PeerKeyKnown => "peer key known",
            Self::ChannelInitSent => "channel init sent",
            Self::Established => "established",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct Channel {
    peer_id: String,
    state: ChannelState,
    proposer: Option<String>,
}

impl Channel {
    fn new(peer_id: &str, state: ChannelState) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            state,
            proposer: None,
        }
    }
}

/// Drives key agreement for every chat of the local identity
pub struct Negotiator {
    local_id: String,
    keys: Arc<KeyStore>,
    key_sent: bool,
    channels: HashMap<String, Channel>,
}

impl Negotiator {
    /// Create a negotiator for `local_id`
    pub fn new(local_id: impl Into<String>, keys: Arc<KeyStore>) -> Self {
        Self {
            local_id: local_id.into(),
            keys,
            key_sent: false,
            channels: HashMap::new(),
        }
    }

    /// Local identity
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Public key broadcast sent right after every connect
    pub fn on_connected(&mut self) -> Result<Envelope> {
        let identity = self.keys.get_or_create_identity_key()?;
        self.key_sent = true;
        for channel in self.channels.values_mut() {
            if channel.state == ChannelState::NoChannel {
                channel.state = ChannelState::KeySent;
            }
        }
        log::debug!("Broadcasting public key {}", identity.fingerprint());
        Ok(Envelope::key_exchange(&self.local_id, BROADCAST, identity.to_base64()))
    }

    /// Forget the broadcast; it is repeated on the next connect
    pub fn on_disconnected(&mut self) {
        self.key_sent = false;
        for channel in self.channels.values_mut() {
            if channel.state == ChannelState::KeySent {
                channel.state = ChannelState::NoChannel;
            }
        }
    }

    /// Handle a KEY_EXCHANGE, returning the envelopes to send in reply
    ///
    /// A broadcast is answered with our own key addressed to the sender.
    /// If no chat key exists yet one is proposed with SECURE_CHANNEL_INIT,
    /// queued ahead of the key reply so the peer can adopt it directly.
    pub fn handle_key_exchange(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>> {
        let peer_id = envelope.sender_id.as_str();
        if peer_id == self.local_id {
            log::debug!("Ignoring our own key exchange");
            return Ok(Vec::new());
        }

        let public_key = decode_content(envelope)?;
        self.keys.save_peer_public_key(peer_id, &public_key)?;
        log::info!("Learned public key of {}", peer_id);

        let chat_id = derive_chat_id(&self.local_id, peer_id);
        let mut replies = Vec::new();

        match self.keys.chat_key(&chat_id)? {
            None => replies.extend(self.propose(&chat_id, peer_id)?),
            Some(existing) => {
                let channel = self
                    .channels
                    .entry(chat_id.clone())
                    .or_insert_with(|| Channel::new(peer_id, ChannelState::Established));

                if channel.proposer.as_deref() == Some(self.local_id.as_str()) {
                    if channel.state != ChannelState::Established {
                        channel.state = ChannelState::ChannelInitSent;
                    }
                    replies.extend(self.offer(&chat_id, peer_id, &existing)?);
                } else {
                    channel.state = ChannelState::Established;
                }
            }
        }

        if envelope.is_broadcast() {
            let identity = self.keys.get_or_create_identity_key()?;
            replies.push(Envelope::key_exchange(
                &self.local_id,
                peer_id,
                identity.to_base64(),
            ));
        }

        Ok(replies)
    }

    /// Handle a SECURE_CHANNEL_INIT
    ///
    /// Returns the chat-id whose key was adopted, or `None` when the
    /// envelope was ignored or lost the tie-break.
    pub fn handle_channel_init(&mut self, envelope: &Envelope) -> Result<Option<String>> {
        let peer_id = envelope.sender_id.as_str();
        if envelope.receiver_id != self.local_id || peer_id == self.local_id {
            log::debug!(
                "Ignoring channel init from {} addressed to {:?}",
                peer_id,
                envelope.receiver_id
            );
            return Ok(None);
        }

        let chat_id = envelope.chat_id_for(&self.local_id).map_err(|e| {
            log::warn!("Rejecting channel init from {}: {}", peer_id, e);
            e
        })?;
        let wrapped = decode_content(envelope)?;

        if let Some(channel) = self.channels.get(&chat_id) {
            if let Some(current) = channel.proposer.as_deref() {
                if current < peer_id {
                    log::info!(
                        "Keeping key proposed by {} for {}, ignoring proposal from {}",
                        current,
                        chat_id,
                        peer_id
                    );
                    return Ok(None);
                }
            }
        }

        let key = self.keys.unwrap_key(&wrapped)?;
        self.keys.store_chat_key(&chat_id, key)?;

        let channel = self
            .channels
            .entry(chat_id.clone())
            .or_insert_with(|| Channel::new(peer_id, ChannelState::NoChannel));
        channel.proposer = Some(peer_id.to_string());
        channel.state = ChannelState::Established;
        log::info!("Secure channel {} established with {}", chat_id, peer_id);

        Ok(Some(chat_id))
    }

    /// Ask for a channel with `peer_id`, returning the envelopes to send
    ///
    /// Proposes a key if the peer's public key is known, otherwise sends our
    /// key directly to the peer so it proposes one.
    pub fn request_channel(&mut self, peer_id: &str) -> Result<Vec<Envelope>> {
        let chat_id = derive_chat_id(&self.local_id, peer_id);
        if self.keys.chat_key(&chat_id)?.is_some() {
            return Ok(Vec::new());
        }

        if self.keys.peer_public_key(peer_id)?.is_some() {
            return self.propose(&chat_id, peer_id);
        }

        let identity = self.keys.get_or_create_identity_key()?;
        self.channels
            .entry(chat_id)
            .or_insert_with(|| Channel::new(peer_id, ChannelState::NoChannel))
            .state = ChannelState::AwaitingPeerKey;

        Ok(vec![Envelope::key_exchange(
            &self.local_id,
            peer_id,
            identity.to_base64(),
        )])
    }

    /// Handshake state of `chat_id`
    pub fn state(&self, chat_id: &str) -> ChannelState {
        match self.channels.get(chat_id) {
            Some(channel) => channel.state,
            None if self.key_sent => ChannelState::KeySent,
            None => ChannelState::NoChannel,
        }
    }

    /// Peer of a known chat
    pub fn peer_of(&self, chat_id: &str) -> Option<&str> {
        self.channels.get(chat_id).map(|c| c.peer_id.as_str())
    }

    /// Record that the peer demonstrably holds the chat key
    ///
    /// Returns true if the chat just became established.
    pub fn mark_confirmed(&mut self, chat_id: &str) -> bool {
        match self.channels.get_mut(chat_id) {
            Some(channel) if channel.state != ChannelState::Established => {
                channel.state = ChannelState::Established;
                log::info!("Secure channel {} confirmed by {}", chat_id, channel.peer_id);
                true
            }
            _ => false,
        }
    }

    /// Stores the new key only once it is wrapped, so an abandoned attempt
    /// leaves the chat without a key and the next key exchange retries.
    fn propose(&mut self, chat_id: &str, peer_id: &str) -> Result<Vec<Envelope>> {
        self.channels
            .entry(chat_id.to_string())
            .or_insert_with(|| Channel::new(peer_id, ChannelState::NoChannel))
            .state = ChannelState::PeerKeyKnown;

        let key = ChatKey::generate();
        let replies = self.offer(chat_id, peer_id, &key)?;
        if replies.is_empty() {
            return Ok(replies);
        }

        self.keys.store_chat_key(chat_id, key)?;
        if let Some(channel) = self.channels.get_mut(chat_id) {
            channel.proposer = Some(self.local_id.clone());
            channel.state = ChannelState::ChannelInitSent;
        }
        log::info!("Proposed chat key for {} to {}", chat_id, peer_id);
        Ok(replies)
    }

    /// Wrap `key` for the peer; an empty result means this attempt was
    /// abandoned and is retried on the next key exchange
    fn offer(&self, chat_id: &str, peer_id: &str, key: &ChatKey) -> Result<Vec<Envelope>> {
        let Some(peer_key) = self.keys.peer_public_key(peer_id)? else {
            return Ok(Vec::new());
        };

        match self.keys.wrap_key_for_peer(key, &peer_key) {
            Ok(wrapped) => Ok(vec![Envelope::secure_channel_init(
                &self.local_id,
                peer_id,
                chat_id,
                STANDARD.encode(wrapped),
            )]),
            Err(ChatError::Crypto(
                e @ (CryptoError::KeyNotAvailable { .. } | CryptoError::WrapFailed { .. }),
            )) => {
                log::warn!("Key negotiation with {} aborted: {}", peer_id, e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

fn decode_content(envelope: &Envelope) -> Result<Vec<u8>> {
    let content = envelope
        .content
        .as_deref()
        .ok_or_else(|| ProtocolError::InvalidEnvelope {
            reason: format!("{} without content", envelope.kind),
        })?;
    Ok(STANDARD.decode(content)?)
}
