//! Symmetric engine: one AEAD-encrypted envelope at `<path>/Symmetric/sym.bin`

use crate::cipher::{self, Nonce, SymmetricAlgorithm, SymmetricKey};
use crate::communicator::Communicator;
use crate::encryption::{object_is_sound, EncryptionKind, ENCRYPTION_METADATA_KEY};
use crate::envelope::{Envelope, Metadata};
use crate::error::{StoreError, StoreResult};
use crate::path::StoragePath;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const OBJECT_NAME: &str = "sym.bin";

/// Key and cipher used by a [`SymmetricEngine`]
#[derive(Debug, Clone)]
pub struct SymmetricSettings {
    /// Content key
    pub key: SymmetricKey,
    /// AEAD cipher
    pub algorithm: SymmetricAlgorithm,
}

/// `encryption` entry merged into stored metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SymmetricMetadata {
    algorithm: String,
    iv: String,
}

/// Encrypts whole payloads under one key.
///
/// Settings are optional: maintenance passes only need [`exists`](Self::exists)
/// and [`ensure_consistent`](Self::ensure_consistent), which never touch the key.
#[derive(Debug, Clone)]
pub struct SymmetricEngine {
    communicator: Communicator,
    settings: Option<SymmetricSettings>,
}

impl SymmetricEngine {
    /// Engine able to encrypt and decrypt with `settings`
    pub fn new(communicator: Communicator, settings: SymmetricSettings) -> Self {
        Self {
            communicator,
            settings: Some(settings),
        }
    }

    /// Engine for consistency checks only
    pub fn keyless(communicator: Communicator) -> Self {
        Self {
            communicator,
            settings: None,
        }
    }

    /// Communicator all objects go through
    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// Location of the encrypted envelope for `path`
    pub fn object_path(path: &StoragePath) -> StoragePath {
        path.join(EncryptionKind::Symmetric.tag()).join(OBJECT_NAME)
    }

    fn settings(&self) -> StoreResult<&SymmetricSettings> {
        self.settings.as_ref().ok_or_else(|| {
            StoreError::Configuration("symmetric engine used without key settings".into())
        })
    }

    /// Encrypt `payload` and store it with `metadata` plus the cipher and IV.
    pub fn encrypt(&self, path: &StoragePath, payload: &[u8], metadata: &Metadata) -> StoreResult<()> {
        if metadata.contains_key(ENCRYPTION_METADATA_KEY) {
            return Err(StoreError::Configuration(format!(
                "metadata key {ENCRYPTION_METADATA_KEY:?} is reserved"
            )));
        }
        let settings = self.settings()?;
        let (ciphertext, nonce) = cipher::encrypt(payload, &settings.key, settings.algorithm)?;

        let mut stored = metadata.clone();
        stored.insert(
            ENCRYPTION_METADATA_KEY.to_string(),
            serde_json::to_value(SymmetricMetadata {
                algorithm: settings.algorithm.name().to_string(),
                iv: BASE64.encode(nonce.0),
            })?,
        );
        let object = Self::object_path(path);
        debug!(path = %object, algorithm = %settings.algorithm, "storing symmetric object");
        self.communicator.upload(&object, &stored, &ciphertext)
    }

    /// Download and decrypt the object at `path`.
    pub fn decrypt(&self, path: &StoragePath) -> StoreResult<Envelope> {
        let settings = self.settings()?;
        let mut envelope = self.communicator.download(&Self::object_path(path), false)?;
        let stored: SymmetricMetadata = envelope
            .metadata
            .get(ENCRYPTION_METADATA_KEY)
            .cloned()
            .ok_or_else(|| StoreError::Decode(format!("no encryption metadata for {path}")))
            .and_then(|v| serde_json::from_value(v).map_err(StoreError::from))?;

        if stored.algorithm != settings.algorithm.name() {
            return Err(StoreError::ConsistencyViolation(format!(
                "Algorithm mismatch: {}:{}",
                settings.algorithm, stored.algorithm
            )));
        }
        let iv = BASE64
            .decode(stored.iv.as_bytes())
            .map_err(|e| StoreError::Decode(format!("bad iv for {path}: {e}")))?;
        let nonce = Nonce::from_slice(&iv)?;
        envelope.payload = cipher::decrypt(&envelope.payload, &nonce, &settings.key, settings.algorithm)?;
        Ok(envelope)
    }

    /// True if the encrypted object exists.
    pub fn exists(&self, path: &StoragePath) -> StoreResult<bool> {
        self.communicator.exists(&Self::object_path(path))
    }

    /// True if the encrypted object is present (and, with `verify_payload`, intact).
    /// Otherwise `path` is deleted and false returned.
    pub fn ensure_consistent(&self, path: &StoragePath, verify_payload: bool) -> StoreResult<bool> {
        if object_is_sound(&self.communicator, &Self::object_path(path), verify_payload)? {
            return Ok(true);
        }
        warn!(path = %path, "No symmetric block data, removing");
        self.communicator.delete(path)?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::MemoryBackend;
    use serde_json::Value;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryBackend>, SymmetricEngine) {
        let backend = Arc::new(MemoryBackend::new());
        let comm = Communicator::new(backend.clone());
        let engine = SymmetricEngine::new(
            comm,
            SymmetricSettings {
                key: SymmetricKey([5u8; 32]),
                algorithm: SymmetricAlgorithm::Aes256Gcm,
            },
        );
        (backend, engine)
    }

    fn md(key: &str, value: i64) -> Metadata {
        let mut m = Metadata::new();
        m.insert(key.into(), Value::from(value));
        m
    }

    #[test]
    fn encrypt_decrypt_keeps_metadata() {
        let (backend, engine) = setup();
        let path = StoragePath::from("obj");
        engine.encrypt(&path, b"plaintext", &md("length", 9)).unwrap();
        assert_eq!(backend.paths(), vec![StoragePath::from("obj/Symmetric/sym.bin")]);

        let env = engine.decrypt(&path).unwrap();
        assert_eq!(env.payload, b"plaintext");
        assert_eq!(env.metadata["length"], 9);
        assert_eq!(env.metadata["encryption"]["algorithm"], "AES-256-GCM");
    }

    #[test]
    fn stored_payload_is_not_plaintext() {
        let (backend, engine) = setup();
        let path = StoragePath::from("obj");
        engine.encrypt(&path, b"very secret words", &Metadata::new()).unwrap();
        let raw = crate::communicator::CommunicatorBackend::download(
            backend.as_ref(),
            &SymmetricEngine::object_path(&path),
        )
        .unwrap();
        assert!(!raw.windows(17).any(|w| w == b"very secret words"));
    }

    #[test]
    fn reserved_metadata_key_rejected() {
        let (_, engine) = setup();
        let err = engine
            .encrypt(&StoragePath::from("obj"), b"x", &md("encryption", 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn algorithm_mismatch_is_consistency_violation() {
        let (backend, engine) = setup();
        let path = StoragePath::from("obj");
        engine.encrypt(&path, b"x", &Metadata::new()).unwrap();
        let other = SymmetricEngine::new(
            Communicator::new(backend),
            SymmetricSettings {
                key: SymmetricKey([5u8; 32]),
                algorithm: SymmetricAlgorithm::ChaCha20Poly1305,
            },
        );
        assert!(matches!(other.decrypt(&path), Err(StoreError::ConsistencyViolation(_))));
    }

    #[test]
    fn keyless_engine_checks_but_cannot_decrypt() {
        let (backend, engine) = setup();
        let path = StoragePath::from("obj");
        engine.encrypt(&path, b"x", &Metadata::new()).unwrap();
        let keyless = SymmetricEngine::keyless(Communicator::new(backend));
        assert!(keyless.exists(&path).unwrap());
        assert!(keyless.ensure_consistent(&path, true).unwrap());
        assert!(matches!(keyless.decrypt(&path), Err(StoreError::Configuration(_))));
    }

    #[test]
    fn ensure_consistent_removes_path_without_object() {
        let (backend, engine) = setup();
        let path = StoragePath::from("obj");
        crate::communicator::CommunicatorBackend::upload(backend.as_ref(), &path.join("stray"), b"")
            .unwrap();
        assert!(!engine.ensure_consistent(&path, false).unwrap());
        assert!(backend.is_empty());
    }
}
