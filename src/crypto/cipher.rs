//! Authenticated symmetric encryption and asymmetric key wrapping.
//!
//! Message payloads are sealed with ChaCha20-Poly1305 under a per-chat
//! [`ChatKey`]. The sealed form is `nonce(12) || ciphertext || tag(16)` with a
//! fresh OS-random nonce per call.
//!
//! Chat keys travel to the peer wrapped to its X25519 public key: an
//! ephemeral key pair is generated per wrap, the shared secret is expanded
//! with HKDF-SHA256 and the raw key bytes are sealed with ChaCha20-Poly1305.
//! A fresh ephemeral key and nonce make every wrap of the same key distinct.

use crate::utils::{CryptoError, Result};
use base64::{engine::general_purpose, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

/// Size of symmetric chat keys
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a wrapped chat key: ephemeral public key, nonce, sealed key, tag
pub const WRAPPED_KEY_SIZE: usize = 32 + NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// HKDF info for the key-wrapping key
const WRAP_INFO: &[u8] = b"secure-chat-core/chat-key-wrap/v1";

/// Symmetric key shared by the two participants of one chat
#[derive(Clone, PartialEq, Eq)]
pub struct ChatKey([u8; KEY_SIZE]);

impl ChatKey {
    /// Generate a fresh random 256-bit key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChatKey([REDACTED])")
    }
}

/// Seal `plaintext` under `key`
pub fn encrypt(plaintext: &[u8], key: &ChatKey) -> Result<Vec<u8>> {
    seal(key.as_bytes(), plaintext)
}

/// Open a sealed envelope produced by [`encrypt`]
///
/// # Errors
///
/// Returns `CryptoError::DecryptionFailed` on tag mismatch or when the input
/// is too short to hold a nonce and a tag
pub fn decrypt(envelope: &[u8], key: &ChatKey) -> Result<Vec<u8>> {
    open(key.as_bytes(), envelope)
}

/// Seal UTF-8 text and base64-encode it for the wire
pub fn encrypt_to_base64(plaintext: &str, key: &ChatKey) -> Result<String> {
    Ok(general_purpose::STANDARD.encode(encrypt(plaintext.as_bytes(), key)?))
}

/// Decode and open wire content produced by [`encrypt_to_base64`]
pub fn decrypt_from_base64(content: &str, key: &ChatKey) -> Result<String> {
    let envelope = general_purpose::STANDARD
        .decode(content)
        .map_err(|e| CryptoError::DecryptionFailed {
            reason: format!("content is not base64: {e}"),
        })?;
    let plaintext = decrypt(&envelope, key)?;
    String::from_utf8(plaintext).map_err(|_| {
        CryptoError::DecryptionFailed {
            reason: "plaintext is not UTF-8".to_string(),
        }
        .into()
    })
}

/// Wrap `key` so only the holder of the private half of `recipient` can
/// recover it
pub fn wrap_key(key: &ChatKey, recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::WrapFailed {
            reason: "recipient public key is a low-order point".to_string(),
        }
        .into());
    }

    let wrapping_key = derive_wrapping_key(&shared, &ephemeral_public, recipient)?;
    let sealed = seal(&wrapping_key, key.as_bytes()).map_err(|e| CryptoError::WrapFailed {
        reason: e.to_string(),
    })?;

    let mut result = Vec::with_capacity(WRAPPED_KEY_SIZE);
    result.extend_from_slice(ephemeral_public.as_bytes());
    result.extend_from_slice(&sealed);
    Ok(result)
}

/// Recover a wrapped key.
///
/// `agree` performs X25519 between the recipient's private key and the
/// ephemeral public key carried in the ciphertext; this lets the private key
/// stay inside secure storage.
pub fn unwrap_key<F>(wrapped: &[u8], recipient: &PublicKey, agree: F) -> Result<ChatKey>
where
    F: FnOnce(&PublicKey) -> Result<SharedSecret>,
{
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(CryptoError::DecryptionFailed {
            reason: format!(
                "wrapped key must be {} bytes, got {}",
                WRAPPED_KEY_SIZE,
                wrapped.len()
            ),
        }
        .into());
    }

    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&wrapped[..32]);
    let ephemeral_public = PublicKey::from(ephemeral);

    let shared = agree(&ephemeral_public)?;
    let wrapping_key = derive_wrapping_key(&shared, &ephemeral_public, recipient)?;
    let raw = open(&wrapping_key, &wrapped[32..])?;

    let bytes: [u8; KEY_SIZE] = raw.as_slice().try_into().map_err(|_| CryptoError::DecryptionFailed {
        reason: "unwrapped key has the wrong length".to_string(),
    })?;
    Ok(ChatKey::from_bytes(bytes))
}

fn derive_wrapping_key(
    shared: &SharedSecret,
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<[u8; KEY_SIZE]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(WRAP_INFO, &mut okm)
        .map_err(|_| CryptoError::WrapFailed {
            reason: "HKDF expansion failed".to_string(),
        })?;
    Ok(okm)
}

fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed {
            reason: "AEAD encryption failed".to_string(),
        })?;

    let mut result = nonce.to_vec();
    result.append(&mut ciphertext);
    Ok(result)
}

fn open(key: &[u8; KEY_SIZE], envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed {
            reason: format!("envelope too short: {} bytes", envelope.len()),
        }
        .into());
    }

    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(&envelope[..NONCE_SIZE]);

    cipher.decrypt(nonce, &envelope[NONCE_SIZE..]).map_err(|_| {
        CryptoError::DecryptionFailed {
            reason: "authentication tag mismatch".to_string(),
        }
        .into()
    })
}
