//! Error types and handling for the secure chat core.
//!
//! Every component reports failures through [`ChatError`]. The sub-enums
//! mirror the layers of the core: transport, wire protocol, cryptography,
//! storage and configuration. None of them is process-fatal; the caller of
//! each layer decides whether to retry, degrade or drop.

use thiserror::Error;

/// Result type alias for the chat core
pub type Result<T> = std::result::Result<T, ChatError>;

/// Unified error type for all chat core operations
#[derive(Error, Debug, Clone)]
pub enum ChatError {
    /// Network and transport layer errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or oversized wire data
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Persistence or secure key storage collaborator failures
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection establishment failure
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The session was shut down with `disconnect()`
    #[error("Connection closed")]
    ConnectionClosed,

    /// No live connection while the session is (re)connecting
    #[error("Not connected")]
    NotConnected,

    /// Timeout during a network operation
    #[error("Transport timeout: {operation}")]
    Timeout { operation: String },

    /// I/O failure on an open stream
    #[error("Transport I/O error: {reason}")]
    Io { reason: String },
}

/// Wire protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Frame could not be parsed as an envelope
    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// Frame exceeds the configured size limit
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Key material of the wrong size on the wire
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// No identity key exists or the secure storage cannot provide it
    #[error("Key not available: {reason}")]
    KeyNotAvailable { reason: String },

    /// Wrapping a symmetric key for a peer failed
    #[error("Key wrap failed: {reason}")]
    WrapFailed { reason: String },

    /// Authentication tag mismatch or malformed ciphertext
    #[error("Decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// AEAD encryption failure
    #[error("Encryption failed: {reason}")]
    EncryptionFailed { reason: String },
}

/// Storage collaborator errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// The backing store rejected or could not serve the request
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    /// Record does not exist
    #[error("Record not found: {id}")]
    NotFound { id: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Failure writing a configuration file
    #[error("I/O error: {reason}")]
    Io { reason: String },
}

impl ChatError {
    /// Returns true if the reconnect loop or a later negotiation recovers
    /// from this error without caller involvement
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::ConnectionFailed { .. }
                    | TransportError::NotConnected
                    | TransportError::Timeout { .. }
                    | TransportError::Io { .. }
            ) | Self::Crypto(CryptoError::KeyNotAvailable { .. } | CryptoError::WrapFailed { .. })
                | Self::Protocol(_)
        )
    }

    /// Returns true if this error may indicate tampering
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Crypto(CryptoError::DecryptionFailed { .. }))
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(TransportError::Io {
            reason: err.to_string(),
        })
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for ChatError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Protocol(ProtocolError::InvalidEnvelope {
            reason: format!("invalid base64: {err}"),
        })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::Transport(TransportError::ConnectionClosed)
            }
            other => Self::Transport(TransportError::Io {
                reason: other.to_string(),
            }),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Unavailable {
            reason: format!("lock poisoned: {err}"),
        }
    }
}
