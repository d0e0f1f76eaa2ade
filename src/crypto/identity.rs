//! Identity keys and the secure key storage seam.
//!
//! The local identity is an X25519 key pair. Only the public half ever
//! leaves the [`SecureKeyStorage`] collaborator: Diffie-Hellman with the
//! private half is performed inside the storage, which is how platform
//! keystores expose hardware-backed keys.

use crate::utils::{ProtocolError, Result, StorageError};
use base64::{engine::general_purpose, Engine};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Mutex;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

/// Length of an encoded X25519 public key
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Public handle to the local identity key pair
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityKey {
    public_key: PublicKey,
}

impl IdentityKey {
    /// Wrap the public half of an identity key pair
    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self { public_key }
    }

    /// Get the X25519 public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.public_key.to_bytes()
    }

    /// Base64 of the raw public key, as carried by KEY_EXCHANGE envelopes
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.public_key.as_bytes())
    }

    /// Short hex fingerprint, safe to log
    pub fn fingerprint(&self) -> String {
        fingerprint(self.public_key.as_bytes())
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// First 8 bytes of SHA-256 over the key, hex encoded
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}

/// Parse raw bytes received from a peer into a public key
///
/// # Errors
///
/// Returns `ProtocolError::InvalidKeyLength` unless exactly 32 bytes are given
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let raw: [u8; PUBLIC_KEY_LENGTH] =
        bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidKeyLength {
                expected: PUBLIC_KEY_LENGTH,
                actual: bytes.len(),
            })?;
    Ok(PublicKey::from(raw))
}

/// Platform secure key storage holding the identity private key.
///
/// Implementations may block on I/O; callers keep them off the frame read
/// loop.
pub trait SecureKeyStorage: Send + Sync {
    /// Public half of the stored identity, if one has been generated
    fn identity_public_key(&self) -> Result<Option<PublicKey>>;

    /// Generate and persist an identity, returning its public half.
    ///
    /// Must return the existing public key instead of replacing an identity
    /// that is already stored.
    fn generate_identity(&self) -> Result<PublicKey>;

    /// X25519 between the stored private key and `peer`
    fn diffie_hellman(&self, peer: &PublicKey) -> Result<SharedSecret>;
}

/// Process-memory key storage.
///
/// Stands in for a platform keystore in tests and headless deployments.
pub struct MemoryKeyStorage {
    secret: Mutex<Option<StaticSecret>>,
    available: bool,
}

impl MemoryKeyStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self {
            secret: Mutex::new(None),
            available: true,
        }
    }

    /// Create a storage whose every operation fails, as a locked or missing
    /// keystore would
    pub fn unavailable() -> Self {
        Self {
            secret: Mutex::new(None),
            available: false,
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                reason: "secure key storage is locked".to_string(),
            }
            .into())
        }
    }
}

impl Default for MemoryKeyStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureKeyStorage for MemoryKeyStorage {
    fn identity_public_key(&self) -> Result<Option<PublicKey>> {
        self.check_available()?;
        let secret = self.secret.lock().map_err(StorageError::from)?;
        Ok(secret.as_ref().map(PublicKey::from))
    }

    fn generate_identity(&self) -> Result<PublicKey> {
        self.check_available()?;
        let mut secret = self.secret.lock().map_err(StorageError::from)?;
        let secret = secret.get_or_insert_with(|| StaticSecret::random_from_rng(OsRng));
        Ok(PublicKey::from(&*secret))
    }

    fn diffie_hellman(&self, peer: &PublicKey) -> Result<SharedSecret> {
        self.check_available()?;
        let secret = self.secret.lock().map_err(StorageError::from)?;
        secret
            .as_ref()
            .map(|secret| secret.diffie_hellman(peer))
            .ok_or_else(|| {
                StorageError::NotFound {
                    id: "identity".to_string(),
                }
                .into()
            })
    }
}
