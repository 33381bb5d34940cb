//! AES-256-GCM and ChaCha20-Poly1305 AEAD primitives

use crate::error::{StoreError, StoreResult};
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Content key length in bytes
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// 256-bit symmetric key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(pub [u8; KEY_LEN]);

impl SymmetricKey {
    /// Fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        SymmetricKey(bytes)
    }

    /// Rebuild a key from unwrapped bytes, which must be exactly [`KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> StoreResult<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            StoreError::Decode(format!("content key must be {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(SymmetricKey(arr))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// 96-bit nonce, stored as the envelope's `iv`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(pub [u8; NONCE_LEN]);

impl Nonce {
    /// Cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Nonce(bytes)
    }

    /// Parse a stored nonce, which must be exactly [`NONCE_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> StoreResult<Self> {
        let arr: [u8; NONCE_LEN] = bytes.try_into().map_err(|_| {
            StoreError::Decode(format!("iv must be {NONCE_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Nonce(arr))
    }
}

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SymmetricAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    /// ChaCha20-Poly1305, constant-time and fast without AES hardware
    #[serde(rename = "ChaCha20-Poly1305")]
    ChaCha20Poly1305,
}

impl SymmetricAlgorithm {
    /// Name recorded in envelope metadata
    pub fn name(&self) -> &'static str {
        match self {
            SymmetricAlgorithm::Aes256Gcm => "AES-256-GCM",
            SymmetricAlgorithm::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }
}

impl fmt::Display for SymmetricAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SymmetricAlgorithm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AES-256-GCM" => Ok(SymmetricAlgorithm::Aes256Gcm),
            "ChaCha20-Poly1305" => Ok(SymmetricAlgorithm::ChaCha20Poly1305),
            other => Err(StoreError::Configuration(format!(
                "Unsupported symmetric algorithm {other}"
            ))),
        }
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
/// The ciphertext carries the 16-byte authentication tag.
pub fn encrypt(
    plaintext: &[u8],
    key: &SymmetricKey,
    algo: SymmetricAlgorithm,
) -> StoreResult<(Vec<u8>, Nonce)> {
    let nonce = Nonce::random();
    let ciphertext = match algo {
        SymmetricAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce.0), plaintext)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?
        }
        SymmetricAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce.0), plaintext)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?
        }
    };
    Ok((ciphertext, nonce))
}

/// Decrypt `ciphertext`. Returns `DecryptionAuthFailed` if tampered or the key is wrong.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &Nonce,
    key: &SymmetricKey,
    algo: SymmetricAlgorithm,
) -> StoreResult<Vec<u8>> {
    match algo {
        SymmetricAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce.0), ciphertext)
                .map_err(|_| StoreError::DecryptionAuthFailed)
        }
        SymmetricAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce.0), ciphertext)
                .map_err(|_| StoreError::DecryptionAuthFailed)
        }
    }
}
