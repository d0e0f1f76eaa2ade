//! Cryptographic primitives and key management.
//!
//! Identity keys never leave the [`SecureKeyStorage`] collaborator; the
//! [`KeyStore`] caches public keys and per-chat symmetric keys, and
//! [`cipher`] seals messages and wraps chat keys.

pub mod cipher;
pub mod identity;
pub mod keystore;

pub use cipher::ChatKey;
pub use identity::{IdentityKey, MemoryKeyStorage, SecureKeyStorage};
pub use keystore::KeyStore;
