//! Key Store: local identity, peer public keys and per-chat keys.
//!
//! The identity key pair lives in the [`SecureKeyStorage`] collaborator; the
//! store caches its public half together with peer public keys and chat
//! keys. There is at most one [`ChatKey`] per chat-id; storing a new one
//! replaces the old.

use crate::crypto::cipher::{self, ChatKey};
use crate::crypto::identity::{parse_public_key, IdentityKey, SecureKeyStorage};
use crate::utils::{ChatError, CryptoError, Result, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use x25519_dalek::PublicKey;

/// Cache of key material used by one local identity
pub struct KeyStore {
    storage: Arc<dyn SecureKeyStorage>,
    identity: RwLock<Option<IdentityKey>>,
    peer_keys: RwLock<HashMap<String, PublicKey>>,
    chat_keys: RwLock<HashMap<String, ChatKey>>,
}

impl KeyStore {
    /// Create a key store backed by `storage`
    pub fn new(storage: Arc<dyn SecureKeyStorage>) -> Self {
        Self {
            storage,
            identity: RwLock::new(None),
            peer_keys: RwLock::new(HashMap::new()),
            chat_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Return the identity key, generating it on first use
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyNotAvailable` only when the secure storage
    /// fails. An identity already in storage is reused, never replaced.
    pub fn get_or_create_identity_key(&self) -> Result<IdentityKey> {
        if let Some(identity) = *self.identity.read().map_err(StorageError::from)? {
            return Ok(identity);
        }

        let mut cached = self.identity.write().map_err(StorageError::from)?;
        if let Some(identity) = *cached {
            return Ok(identity);
        }

        let public_key = match self.storage.identity_public_key().map_err(key_not_available)? {
            Some(existing) => existing,
            None => {
                let generated = self.storage.generate_identity().map_err(key_not_available)?;
                log::info!(
                    "Generated identity key {}",
                    IdentityKey::from_public_key(generated).fingerprint()
                );
                generated
            }
        };

        let identity = IdentityKey::from_public_key(public_key);
        *cached = Some(identity);
        Ok(identity)
    }

    /// Remember `peer_id`'s public key, replacing any earlier one
    pub fn save_peer_public_key(&self, peer_id: &str, bytes: &[u8]) -> Result<()> {
        let key = parse_public_key(bytes)?;
        self.peer_keys
            .write()
            .map_err(StorageError::from)?
            .insert(peer_id.to_string(), key);
        Ok(())
    }

    /// Look up a peer's public key
    pub fn peer_public_key(&self, peer_id: &str) -> Result<Option<PublicKey>> {
        Ok(self
            .peer_keys
            .read()
            .map_err(StorageError::from)?
            .get(peer_id)
            .copied())
    }

    /// Return the chat key for `chat_id`, generating and storing a fresh
    /// 256-bit key if none exists
    ///
    /// The negotiator does not use this: a proposed key is stored only after
    /// it has been wrapped for the peer, see [`Self::store_chat_key`].
    pub fn get_or_create_chat_key(&self, chat_id: &str) -> Result<ChatKey> {
        let mut keys = self.chat_keys.write().map_err(StorageError::from)?;
        Ok(keys
            .entry(chat_id.to_string())
            .or_insert_with(ChatKey::generate)
            .clone())
    }

    /// Look up the chat key for `chat_id`
    pub fn chat_key(&self, chat_id: &str) -> Result<Option<ChatKey>> {
        Ok(self
            .chat_keys
            .read()
            .map_err(StorageError::from)?
            .get(chat_id)
            .cloned())
    }

    /// Store `key` for `chat_id`, replacing any earlier key
    pub fn store_chat_key(&self, chat_id: &str, key: ChatKey) -> Result<()> {
        self.chat_keys
            .write()
            .map_err(StorageError::from)?
            .insert(chat_id.to_string(), key);
        Ok(())
    }

    /// Wrap `key` for the holder of `peer_public_key`
    pub fn wrap_key_for_peer(&self, key: &ChatKey, peer_public_key: &PublicKey) -> Result<Vec<u8>> {
        cipher::wrap_key(key, peer_public_key)
    }

    /// Recover a chat key wrapped to the local identity
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyNotAvailable` if no identity exists yet and
    /// `CryptoError::DecryptionFailed` if the ciphertext does not open
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<ChatKey> {
        let identity = self
            .storage
            .identity_public_key()
            .map_err(key_not_available)?
            .ok_or_else(|| CryptoError::KeyNotAvailable {
                reason: "no identity key has been created".to_string(),
            })?;

        cipher::unwrap_key(wrapped, &identity, |ephemeral| {
            self.storage
                .diffie_hellman(ephemeral)
                .map_err(key_not_available)
        })
    }
}

fn key_not_available(err: ChatError) -> ChatError {
    match err {
        ChatError::Crypto(_) => err,
        other => CryptoError::KeyNotAvailable {
            reason: other.to_string(),
        }
        .into(),
    }
}
