//! Wire envelope definitions and serialization.
//!
//! One JSON object travels per text frame:
//!
//! ```json
//! {"senderId":"alice","receiverId":"bob","chatId":"direct:alice:bob",
//!  "type":"TEXT","content":"<base64>","timestamp":1700000000000}
//! ```
//!
//! An empty `receiverId` addresses every connected peer.

use crate::utils::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag prefixed to every two-party chat-id
pub const DIRECT_CHAT_TAG: &str = "direct";

/// Separator between the parts of a chat-id
pub const CHAT_ID_SEPARATOR: char = ':';

/// Receiver id used for broadcasts
pub const BROADCAST: &str = "";

/// Kind of an envelope, as carried in its `type` field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Encrypted text message
    Text,
    /// Encrypted image reference
    Image,
    /// Encrypted video reference
    Video,
    /// Encrypted file reference
    File,
    /// Encrypted audio reference
    Audio,
    /// Encrypted `payload|ttlSeconds` message deleted after the TTL
    SelfDestruct,
    /// Plaintext base64 public key announcement
    KeyExchange,
    /// Plaintext base64 wrapped chat key
    SecureChannelInit,
    /// Any kind this core does not interpret (typing, presence, ...)
    Other(String),
}

impl MessageKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::File => "FILE",
            Self::Audio => "AUDIO",
            Self::SelfDestruct => "SELF_DESTRUCT",
            Self::KeyExchange => "KEY_EXCHANGE",
            Self::SecureChannelInit => "SECURE_CHANNEL_INIT",
            Self::Other(name) => name,
        }
    }

    /// True for the handshake kinds whose content travels unencrypted
    pub fn is_control(&self) -> bool {
        matches!(self, Self::KeyExchange | Self::SecureChannelInit)
    }

    /// True for the kinds whose content is sealed with the chat key
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::Image | Self::Video | Self::File | Self::Audio | Self::SelfDestruct
        )
    }
}

impl From<String> for MessageKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "TEXT" => Self::Text,
            "IMAGE" => Self::Image,
            "VIDEO" => Self::Video,
            "FILE" => Self::File,
            "AUDIO" => Self::Audio,
            "SELF_DESTRUCT" => Self::SelfDestruct,
            "KEY_EXCHANGE" => Self::KeyExchange,
            "SECURE_CHANNEL_INIT" => Self::SecureChannelInit,
            _ => Self::Other(name),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope carried by one transport frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Identity of the sender
    pub sender_id: String,
    /// Identity of the receiver, empty for broadcasts
    #[serde(default)]
    pub receiver_id: String,
    /// Conversation this envelope belongs to, may be empty for control kinds
    #[serde(default)]
    pub chat_id: String,
    /// Kind of the envelope
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Plaintext for control kinds, base64 sealed envelope otherwise
    #[serde(default)]
    pub content: Option<String>,
    /// Unix time in milliseconds
    pub timestamp: i64,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        chat_id: impl Into<String>,
        kind: MessageKind,
        content: Option<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            chat_id: chat_id.into(),
            kind,
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Public key announcement; `receiver_id` is [`BROADCAST`] for the
    /// announcement sent on connect
    pub fn key_exchange(sender_id: &str, receiver_id: &str, public_key_base64: String) -> Self {
        Self::new(
            sender_id,
            receiver_id,
            String::new(),
            MessageKind::KeyExchange,
            Some(public_key_base64),
        )
    }

    /// Wrapped chat key addressed to `receiver_id`
    pub fn secure_channel_init(
        sender_id: &str,
        receiver_id: &str,
        chat_id: &str,
        wrapped_key_base64: String,
    ) -> Self {
        Self::new(
            sender_id,
            receiver_id,
            chat_id,
            MessageKind::SecureChannelInit,
            Some(wrapped_key_base64),
        )
    }

    /// True if this envelope is addressed to every peer
    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST
    }

    /// Chat between `local_id` and the sender
    ///
    /// An explicit `chatId` is only accepted when it names that chat, so a
    /// peer can never address a conversation it is not part of.
    pub fn chat_id_for(&self, local_id: &str) -> Result<String> {
        let expected = derive_chat_id(local_id, &self.sender_id);
        if self.chat_id.is_empty() || self.chat_id == expected {
            Ok(expected)
        } else {
            Err(ProtocolError::InvalidEnvelope {
                reason: format!(
                    "chat {} does not belong to {} and {}",
                    self.chat_id, self.sender_id, local_id
                ),
            }
            .into())
        }
    }

    /// Serialize to the JSON text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::FrameTooLarge` above `max_size` bytes and
    /// `ProtocolError::InvalidEnvelope` for anything that is not an envelope
    pub fn from_json(frame: &str, max_size: usize) -> Result<Self> {
        if frame.len() > max_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: max_size,
            }
            .into());
        }

        let envelope: Self =
            serde_json::from_str(frame).map_err(|e| ProtocolError::InvalidEnvelope {
                reason: e.to_string(),
            })?;

        validate_identity(&envelope.sender_id).map_err(|reason| {
            ProtocolError::InvalidEnvelope {
                reason: format!("senderId: {reason}"),
            }
        })?;
        if !envelope.is_broadcast() {
            validate_identity(&envelope.receiver_id).map_err(|reason| {
                ProtocolError::InvalidEnvelope {
                    reason: format!("receiverId: {reason}"),
                }
            })?;
        }

        Ok(envelope)
    }
}

/// Check that `identity` can take part in a chat-id
///
/// Identities are joined with `:` inside chat-ids, so the separator is not
/// allowed in them.
pub fn validate_identity(identity: &str) -> std::result::Result<(), String> {
    if identity.is_empty() {
        Err("identity is empty".to_string())
    } else if identity.contains(CHAT_ID_SEPARATOR) {
        Err(format!("identity {identity:?} contains '{CHAT_ID_SEPARATOR}'"))
    } else {
        Ok(())
    }
}

/// Canonical, order-independent chat-id for a two-party conversation
pub fn derive_chat_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{DIRECT_CHAT_TAG}{CHAT_ID_SEPARATOR}{first}{CHAT_ID_SEPARATOR}{second}")
}

/// State of the single logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no reconnect pending
    Disconnected,
    /// Opening the stream
    Connecting,
    /// Stream open
    Connected,
    /// Stream failed; a reconnect is scheduled
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ChatError;

    #[test]
    fn test_chat_id_is_commutative() {
        let names = ["alice", "bob", "Bob", "", "zoë", "42"];
        for a in names {
            for b in names {
                assert_eq!(derive_chat_id(a, b), derive_chat_id(b, a));
            }
        }
        assert_eq!(derive_chat_id("bob", "alice"), "direct:alice:bob");
    }

    #[test]
    fn test_wire_format() {
        let envelope = Envelope {
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            chat_id: "direct:alice:bob".to_string(),
            kind: MessageKind::SelfDestruct,
            content: None,
            timestamp: 1_700_000_000_000,
        };

        let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["receiverId"], "bob");
        assert_eq!(json["chatId"], "direct:alice:bob");
        assert_eq!(json["type"], "SELF_DESTRUCT");
        assert!(json["content"].is_null());
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let frame = r#"{"senderId":"bob","receiverId":"alice","chatId":"c","type":"TYPING","content":null,"timestamp":5}"#;
        let envelope = Envelope::from_json(frame, 1024).unwrap();
        assert_eq!(envelope.kind, MessageKind::Other("TYPING".to_string()));
        assert!(envelope.to_json().unwrap().contains("\"TYPING\""));
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        for frame in ["", "not json", "{}", r#"{"senderId":"","type":"TEXT","timestamp":1}"#] {
            assert!(matches!(
                Envelope::from_json(frame, 1024),
                Err(ChatError::Protocol(ProtocolError::InvalidEnvelope { .. }))
            ));
        }

        let big = "x".repeat(2048);
        assert!(matches!(
            Envelope::from_json(&big, 1024),
            Err(ChatError::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
    }

    #[test]
    fn test_chat_id_for_receiver() {
        let mut envelope =
            Envelope::secure_channel_init("bob", "alice", "", "AAAA".to_string());
        assert_eq!(envelope.chat_id_for("alice").unwrap(), "direct:alice:bob");

        envelope.chat_id = "direct:alice:bob".to_string();
        assert_eq!(envelope.chat_id_for("alice").unwrap(), "direct:alice:bob");

        envelope.sender_id = "aaron".to_string();
        assert!(matches!(
            envelope.chat_id_for("alice"),
            Err(ChatError::Protocol(ProtocolError::InvalidEnvelope { .. }))
        ));
    }

    #[test]
    fn test_identities_with_separator_are_rejected() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("a:b").is_err());

        for frame in [
            r#"{"senderId":"a:b","receiverId":"c","chatId":"","type":"TEXT","content":null,"timestamp":1}"#,
            r#"{"senderId":"a","receiverId":"b:c","chatId":"","type":"TEXT","content":null,"timestamp":1}"#,
        ] {
            assert!(matches!(
                Envelope::from_json(frame, 1024),
                Err(ChatError::Protocol(ProtocolError::InvalidEnvelope { .. }))
            ));
        }
    }

    #[test]
    fn test_kind_classification() {
        assert!(MessageKind::KeyExchange.is_control());
        assert!(MessageKind::SelfDestruct.is_content());
        let other = MessageKind::from("PRESENCE".to_string());
        assert!(!other.is_control() && !other.is_content());
    }
}
