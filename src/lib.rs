//! # Secure Chat Core
//!
//! End-to-end messaging core of a peer-to-peer chat client. It establishes a
//! confidential channel between two identities over an unreliable
//! bidirectional transport, seals message payloads with a per-chat key and
//! keeps the logical connection alive across transient failures.
//!
//! ## Features
//!
//! - **Key agreement**: X25519 identity keys; per-chat keys wrapped with an
//!   ephemeral X25519 + HKDF-SHA256 + ChaCha20-Poly1305 scheme
//! - **Message sealing**: ChaCha20-Poly1305 with a fresh random nonce per message
//! - **Deterministic negotiation**: simultaneous key proposals converge on
//!   the lexicographically smaller identity's key
//! - **Resilient transport**: one WebSocket connection with exponential
//!   reconnect backoff and cooperative cancellation
//! - **Self-destructing messages**: `payload|ttlSeconds` content deleted
//!   after its TTL
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use secure_chat_core::{ChatClient, ChatConfig, MemoryKeyStorage, MemoryMessageStore};
//! use secure_chat_core::transport::WebSocketConnector;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChatConfig::load(None)?;
//!     let connector = Arc::new(WebSocketConnector::new(config.transport.endpoint.clone()));
//!     let mut client = ChatClient::new(
//!         config,
//!         "alice",
//!         Arc::new(MemoryKeyStorage::new()),
//!         Arc::new(MemoryMessageStore::new()),
//!         connector,
//!     )
//!     .await?;
//!
//!     let mut events = client.events().expect("events taken once");
//!     client.connect();
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: identity keys, the cipher engine and the key store
//! - [`session`]: the per-chat secure channel negotiator
//! - [`transport`]: wire envelope, connectors and the session manager
//! - [`router`]: dispatch of inbound envelopes
//! - [`storage`]: message persistence seam and self-destruct timers
//! - [`utils`]: configuration, errors and logging

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod router;
pub mod session;
pub mod storage;
pub mod transport;
pub mod utils;

pub use app::ChatClient;
pub use crypto::{ChatKey, IdentityKey, KeyStore, MemoryKeyStorage, SecureKeyStorage};
pub use router::{ChatEvent, InboundMessage};
pub use session::{ChannelState, Negotiator};
pub use storage::{MemoryMessageStore, MessageRecord, MessageStore};
pub use transport::{ConnectionState, Envelope, MessageKind};
pub use utils::{ChatConfig, ChatError, Result};

/// Largest inbound frame accepted by default, in bytes (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default relay endpoint
    pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/chat";

    /// Default connect timeout in seconds
    pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;
}
