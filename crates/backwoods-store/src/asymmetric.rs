//! Hybrid RSA engine: one symmetric content block shared by many recipients.
//!
//! Layout below an object path `<p>`:
//!
//! ```text
//! <p>/ASymmetricRSA/asym_blocks/<content key id>/Symmetric/sym.bin
//! <p>/ASymmetricRSA/asym_keys/<recipient id>/sym_key.bin
//! ```
//!
//! Each `sym_key.bin` holds the content key wrapped with RSA-OAEP for one
//! recipient plus a pointer to the content block it opens.

use crate::checksum::{ChecksumAlgorithm, ChecksumEngine};
use crate::cipher::{SymmetricAlgorithm, SymmetricKey};
use crate::communicator::Communicator;
use crate::encryption::EncryptionKind;
use crate::envelope::{Envelope, Metadata};
use crate::error::{StoreError, StoreResult};
use crate::path::StoragePath;
use crate::symmetric::{SymmetricEngine, SymmetricSettings};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

/// Algorithm tag recorded in every key wrapper
pub const WRAPPER_ALGORITHM: &str = "RSA";

const KEYS_DIR: &str = "asym_keys";
const BLOCKS_DIR: &str = "asym_blocks";
const WRAPPER_NAME: &str = "sym_key.bin";

/// Ids are checksums so user-chosen names never end up in storage paths.
const ID_CHECKSUM: ChecksumAlgorithm = ChecksumAlgorithm::Sha256;

/// A named RSA key pair. Either half may be absent: a public key can
/// encrypt, a private key can decrypt.
#[derive(Clone)]
pub struct RecipientKey {
    name: String,
    public: Option<RsaPublicKey>,
    private: Option<RsaPrivateKey>,
}

impl fmt::Debug for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipientKey")
            .field("name", &self.name)
            .field("public", &self.public.is_some())
            .field("private", &self.private.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl RecipientKey {
    /// Build from already parsed key halves
    pub fn new(name: impl Into<String>, public: Option<RsaPublicKey>, private: Option<RsaPrivateKey>) -> Self {
        Self {
            name: name.into(),
            public,
            private,
        }
    }

    /// Parse PEM-encoded halves (PKCS#8 or PKCS#1).
    pub fn from_pem(name: impl Into<String>, public: Option<&str>, private: Option<&str>) -> StoreResult<Self> {
        let name = name.into();
        let public = public
            .map(|pem| {
                RsaPublicKey::from_public_key_pem(pem)
                    .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
                    .map_err(|e| {
                        StoreError::Configuration(format!("bad public key for {name}: {e}"))
                    })
            })
            .transpose()?;
        let private = private
            .map(|pem| {
                RsaPrivateKey::from_pkcs8_pem(pem)
                    .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                    .map_err(|e| {
                        StoreError::Configuration(format!("bad private key for {name}: {e}"))
                    })
            })
            .transpose()?;
        Ok(Self::new(name, public, private))
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage identity: checksum of the name
    pub fn id(&self) -> String {
        ChecksumEngine::new(ID_CHECKSUM).block(self.name.as_bytes()).to_string()
    }

    /// True if this key can wrap content keys
    pub fn can_encrypt(&self) -> bool {
        self.public.is_some()
    }

    /// True if this key can unwrap content keys
    pub fn can_decrypt(&self) -> bool {
        self.private.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WrapperMetadata {
    encryption: WrapperEncryption,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WrapperEncryption {
    algorithm: String,
    target: WrapperTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WrapperTarget {
    algorithm: String,
    path: StoragePath,
}

impl WrapperMetadata {
    fn parse(metadata: Metadata) -> StoreResult<Self> {
        Ok(serde_json::from_value(Value::Object(metadata))?)
    }

    fn into_metadata(self) -> StoreResult<Metadata> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(StoreError::Encode("wrapper metadata is not an object".into())),
        }
    }
}

/// Hybrid engine over a fixed set of recipients
#[derive(Debug, Clone)]
pub struct AsymmetricRsaEngine {
    communicator: Communicator,
    recipients: Vec<(String, RecipientKey)>,
    symmetric_algorithm: SymmetricAlgorithm,
}

impl AsymmetricRsaEngine {
    /// Engine for `recipients`. Two names with the same id are rejected.
    pub fn new(
        communicator: Communicator,
        recipients: impl IntoIterator<Item = RecipientKey>,
        symmetric_algorithm: SymmetricAlgorithm,
    ) -> StoreResult<Self> {
        let mut seen = HashSet::new();
        let mut keyed = Vec::new();
        for key in recipients {
            let id = key.id();
            if !seen.insert(id.clone()) {
                return Err(StoreError::Configuration(format!(
                    "Key name checksum collision for {}",
                    key.name
                )));
            }
            keyed.push((id, key));
        }
        Ok(Self {
            communicator,
            recipients: keyed,
            symmetric_algorithm,
        })
    }

    /// Engine with no recipients, for consistency checks only
    pub fn keyless(communicator: Communicator) -> Self {
        Self {
            communicator,
            recipients: Vec::new(),
            symmetric_algorithm: SymmetricAlgorithm::default(),
        }
    }

    /// Communicator all objects go through
    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// Configured recipients in order
    pub fn recipients(&self) -> impl Iterator<Item = &RecipientKey> {
        self.recipients.iter().map(|(_, k)| k)
    }

    fn base(path: &StoragePath) -> StoragePath {
        path.join(EncryptionKind::AsymmetricRsa.tag())
    }

    /// Wrapper location for recipient `recipient_id` under object `path`
    pub fn wrapper_path(path: &StoragePath, recipient_id: &str) -> StoragePath {
        Self::base(path).join(KEYS_DIR).join(recipient_id).join(WRAPPER_NAME)
    }

    fn blocks_dir(path: &StoragePath) -> StoragePath {
        Self::base(path).join(BLOCKS_DIR)
    }

    /// Encrypt `payload` once under a fresh content key and wrap that key for every recipient.
    pub fn encrypt(&self, path: &StoragePath, payload: &[u8], metadata: &Metadata) -> StoreResult<()> {
        if self.recipients.is_empty() {
            return Err(StoreError::Configuration("no recipient keys configured".into()));
        }
        if let Some((_, key)) = self.recipients.iter().find(|(_, k)| !k.can_encrypt()) {
            return Err(StoreError::Configuration(format!("No public key for {}", key.name)));
        }

        let key = SymmetricKey::generate();
        let key_id = ChecksumEngine::new(ID_CHECKSUM).block(key.as_bytes()).to_string();
        let block_path = Self::blocks_dir(path).join(&key_id);
        SymmetricEngine::new(
            self.communicator.clone(),
            SymmetricSettings {
                key: key.clone(),
                algorithm: self.symmetric_algorithm,
            },
        )
        .encrypt(&block_path, payload, metadata)?;

        let wrapper_metadata = WrapperMetadata {
            encryption: WrapperEncryption {
                algorithm: WRAPPER_ALGORITHM.to_string(),
                target: WrapperTarget {
                    algorithm: self.symmetric_algorithm.name().to_string(),
                    path: block_path.clone(),
                },
            },
        }
        .into_metadata()?;

        let mut rng = rand::thread_rng();
        for (id, recipient) in &self.recipients {
            let public = recipient
                .public
                .as_ref()
                .ok_or_else(|| StoreError::Configuration(format!("No public key for {}", recipient.name)))?;
            let wrapped = public
                .encrypt(&mut rng, Oaep::new::<Sha256>(), key.as_bytes())
                .map_err(|e| StoreError::EncryptionFailed(format!("wrap for {}: {e}", recipient.name)))?;
            self.communicator
                .upload(&Self::wrapper_path(path, id), &wrapper_metadata, &wrapped)?;
        }
        debug!(path = %path, block = %block_path, recipients = self.recipients.len(), "stored hybrid object");
        Ok(())
    }

    /// Decrypt with the first recipient holding both a private key and a wrapper.
    pub fn decrypt(&self, path: &StoragePath) -> StoreResult<Envelope> {
        for (id, recipient) in &self.recipients {
            let Some(private) = recipient.private.as_ref() else {
                debug!(key = %recipient.name, "no private key, skipping");
                continue;
            };
            let wrapper_path = Self::wrapper_path(path, id);
            if !self.communicator.exists(&wrapper_path)? {
                continue;
            }

            let (envelope, wrapper) = match self
                .communicator
                .download(&wrapper_path, false)
                .and_then(|envelope| {
                    let wrapper = WrapperMetadata::parse(envelope.metadata.clone())?;
                    Ok((envelope, wrapper))
                }) {
                Ok(read) => read,
                Err(e) if e.is_corruption() => {
                    warn!(key = %recipient.name, path = %wrapper_path, error = %e, "unreadable key wrapper");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if wrapper.encryption.algorithm != WRAPPER_ALGORITHM {
                return Err(StoreError::ConsistencyViolation(format!(
                    "Algorithm mismatch: {WRAPPER_ALGORITHM}:{}",
                    wrapper.encryption.algorithm
                )));
            }
            let raw_key = match private.decrypt(Oaep::new::<Sha256>(), &envelope.payload) {
                Ok(k) => k,
                Err(e) => {
                    warn!(key = %recipient.name, path = %path, error = %e, "unable to unwrap content key");
                    continue;
                }
            };
            let settings = SymmetricSettings {
                key: SymmetricKey::from_slice(&raw_key)?,
                algorithm: wrapper.encryption.target.algorithm.parse()?,
            };
            return SymmetricEngine::new(self.communicator.clone(), settings)
                .decrypt(&wrapper.encryption.target.path);
        }
        Err(StoreError::NoUsableKey(path.clone()))
    }

    /// True if a wrapper exists for every configured recipient. The content block is not checked.
    pub fn exists(&self, path: &StoragePath) -> StoreResult<bool> {
        if self.recipients.is_empty() {
            return Ok(false);
        }
        for (id, _) in &self.recipients {
            if !self.communicator.exists(&Self::wrapper_path(path, id))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drop broken wrappers and orphaned content blocks under `path`.
    /// If no wrapper survives, `path` is deleted and false returned.
    pub fn ensure_consistent(&self, path: &StoragePath, verify_payload: bool) -> StoreResult<bool> {
        let keys_dir = Self::base(path).join(KEYS_DIR);
        let blocks_dir = Self::blocks_dir(path);
        let symmetric = SymmetricEngine::keyless(self.communicator.clone());
        let mut live_blocks = HashSet::new();

        for key_dir in self.communicator.list(&keys_dir, 1)? {
            let wrapper_path = key_dir.join(WRAPPER_NAME);
            let target = match self.wrapper_target(&wrapper_path, verify_payload) {
                Ok(target) => target,
                Err(e) if e.is_corruption() => {
                    warn!(path = %key_dir, error = %e, "Removing unreadable key wrapper");
                    self.communicator.delete(&key_dir)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if target.parent().as_ref() != Some(&blocks_dir) {
                warn!(path = %key_dir, target = %target, "Removing key wrapper pointing outside its object");
                self.communicator.delete(&key_dir)?;
                continue;
            }
            if !symmetric.ensure_consistent(&target, verify_payload)? {
                warn!(path = %key_dir, target = %target, "Removing key wrapper for missing content block");
                self.communicator.delete(&key_dir)?;
                continue;
            }
            live_blocks.insert(target);
        }

        if live_blocks.is_empty() {
            warn!(path = %path, "No usable key wrappers, removing");
            self.communicator.delete(path)?;
            return Ok(false);
        }

        for block in self.communicator.list(&blocks_dir, 1)? {
            if !live_blocks.contains(&block) {
                info!(path = %block, "Removing orphaned content block");
                self.communicator.delete(&block)?;
            }
        }
        Ok(true)
    }

    fn wrapper_target(&self, wrapper_path: &StoragePath, verify_payload: bool) -> StoreResult<StoragePath> {
        let envelope = self.communicator.download(wrapper_path, verify_payload)?;
        let wrapper = WrapperMetadata::parse(envelope.metadata)?;
        if wrapper.encryption.algorithm != WRAPPER_ALGORITHM {
            return Err(StoreError::Decode(format!(
                "unexpected wrapper algorithm {}",
                wrapper.encryption.algorithm
            )));
        }
        Ok(wrapper.encryption.target.path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::communicator::CommunicatorBackend;
    use crate::memory_backend::MemoryBackend;
    use std::sync::{Arc, OnceLock};

    /// Small RSA pairs so tests stay fast; generated once per test binary.
    pub(crate) fn test_pairs() -> &'static [(RsaPublicKey, RsaPrivateKey)] {
        static PAIRS: OnceLock<Vec<(RsaPublicKey, RsaPrivateKey)>> = OnceLock::new();
        PAIRS.get_or_init(|| {
            let mut rng = rand::thread_rng();
            (0..3)
                .map(|_| {
                    let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
                    (RsaPublicKey::from(&private), private)
                })
                .collect()
        })
    }

    pub(crate) fn full_key(name: &str, idx: usize) -> RecipientKey {
        let (public, private) = test_pairs()[idx].clone();
        RecipientKey::new(name, Some(public), Some(private))
    }

    fn private_only(name: &str, idx: usize) -> RecipientKey {
        RecipientKey::new(name, None, Some(test_pairs()[idx].1.clone()))
    }

    fn engine(backend: &Arc<MemoryBackend>, keys: Vec<RecipientKey>) -> AsymmetricRsaEngine {
        AsymmetricRsaEngine::new(Communicator::new(backend.clone()), keys, SymmetricAlgorithm::Aes256Gcm)
            .unwrap()
    }

    fn path() -> StoragePath {
        StoragePath::from("blocks/sha256:abc/5")
    }

    #[test]
    fn either_recipient_decrypts_alone() {
        let backend = Arc::new(MemoryBackend::new());
        engine(&backend, vec![full_key("a", 0), full_key("b", 1)])
            .encrypt(&path(), b"hello", &Metadata::new())
            .unwrap();

        for (name, idx) in [("a", 0), ("b", 1)] {
            let env = engine(&backend, vec![private_only(name, idx)]).decrypt(&path()).unwrap();
            assert_eq!(env.payload, b"hello");
        }
        let stranger = engine(&backend, vec![private_only("c", 2)]);
        assert!(matches!(stranger.decrypt(&path()), Err(StoreError::NoUsableKey(_))));
    }

    #[test]
    fn layout_has_one_block_and_one_wrapper_per_recipient() {
        let backend = Arc::new(MemoryBackend::new());
        let e = engine(&backend, vec![full_key("a", 0), full_key("b", 1)]);
        e.encrypt(&path(), b"hello", &Metadata::new()).unwrap();
        let comm = e.communicator();
        let base = path().join("ASymmetricRSA");
        assert_eq!(comm.list(&base.join("asym_keys"), 1).unwrap().len(), 2);
        assert_eq!(comm.list(&base.join("asym_blocks"), 1).unwrap().len(), 1);
        assert!(e.exists(&path()).unwrap());
    }

    #[test]
    fn missing_public_key_fails_before_upload() {
        let backend = Arc::new(MemoryBackend::new());
        let e = engine(&backend, vec![full_key("a", 0), private_only("b", 1)]);
        let err = e.encrypt(&path(), b"hello", &Metadata::new()).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(backend.is_empty());
    }

    #[test]
    fn name_collision_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let result = AsymmetricRsaEngine::new(
            Communicator::new(backend),
            vec![full_key("a", 0), full_key("a", 1)],
            SymmetricAlgorithm::Aes256Gcm,
        );
        assert!(matches!(result, Err(StoreError::Configuration(_))));
    }

    #[test]
    fn self_heal_keeps_surviving_wrapper() {
        let backend = Arc::new(MemoryBackend::new());
        let keys = vec![full_key("a", 0), full_key("b", 1)];
        let e = engine(&backend, keys.clone());
        e.encrypt(&path(), b"hello", &Metadata::new()).unwrap();

        let a_id = keys[0].id();
        let a_dir = AsymmetricRsaEngine::wrapper_path(&path(), &a_id).parent().unwrap();
        backend.delete(&a_dir).unwrap();
        assert!(!e.exists(&path()).unwrap());

        let keyless = AsymmetricRsaEngine::keyless(Communicator::new(backend.clone()));
        assert!(keyless.ensure_consistent(&path(), true).unwrap());
        assert!(backend.exists(&AsymmetricRsaEngine::wrapper_path(&path(), &keys[1].id())).unwrap());
        assert_eq!(
            e.communicator().list(&path().join("ASymmetricRSA/asym_blocks"), 1).unwrap().len(),
            1
        );
        assert!(!e.exists(&path()).unwrap());
        assert_eq!(engine(&backend, vec![private_only("b", 1)]).decrypt(&path()).unwrap().payload, b"hello");
    }

    #[test]
    fn orphaned_blocks_are_removed() {
        let backend = Arc::new(MemoryBackend::new());
        let e = engine(&backend, vec![full_key("a", 0)]);
        // Second encrypt rewrites the wrapper to a new block, orphaning the first.
        e.encrypt(&path(), b"one", &Metadata::new()).unwrap();
        e.encrypt(&path(), b"two", &Metadata::new()).unwrap();
        let blocks = path().join("ASymmetricRSA/asym_blocks");
        assert_eq!(e.communicator().list(&blocks, 1).unwrap().len(), 2);

        assert!(e.ensure_consistent(&path(), false).unwrap());
        assert_eq!(e.communicator().list(&blocks, 1).unwrap().len(), 1);
        assert_eq!(e.decrypt(&path()).unwrap().payload, b"two");
    }

    #[test]
    fn wrapper_to_missing_block_removes_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let e = engine(&backend, vec![full_key("a", 0)]);
        e.encrypt(&path(), b"one", &Metadata::new()).unwrap();
        backend.delete(&path().join("ASymmetricRSA/asym_blocks")).unwrap();

        assert!(!e.ensure_consistent(&path(), false).unwrap());
        assert!(backend.is_empty());
    }

    #[test]
    fn corrupt_wrapper_is_removed() {
        let backend = Arc::new(MemoryBackend::new());
        let keys = vec![full_key("a", 0), full_key("b", 1)];
        let e = engine(&backend, keys.clone());
        e.encrypt(&path(), b"one", &Metadata::new()).unwrap();
        let a_wrapper = AsymmetricRsaEngine::wrapper_path(&path(), &keys[0].id());
        backend.upload(&a_wrapper, b"\x01garbage").unwrap();

        assert!(e.ensure_consistent(&path(), false).unwrap());
        assert!(!backend.exists(&a_wrapper).unwrap());
        assert!(backend.exists(&AsymmetricRsaEngine::wrapper_path(&path(), &keys[1].id())).unwrap());
    }

    #[test]
    fn damaged_wrapper_falls_through_to_next_recipient() {
        let backend = Arc::new(MemoryBackend::new());
        let keys = vec![full_key("a", 0), full_key("b", 1)];
        let e = engine(&backend, keys.clone());
        // Damage each recipient's wrapper in turn so both iteration orders are covered.
        for damaged in &keys {
            e.encrypt(&path(), b"hello", &Metadata::new()).unwrap();
            let wrapper = AsymmetricRsaEngine::wrapper_path(&path(), &damaged.id());
            backend.upload(&wrapper, b"\x01garbage").unwrap();
            assert_eq!(e.decrypt(&path()).unwrap().payload, b"hello");
        }

        for key in &keys {
            backend
                .upload(&AsymmetricRsaEngine::wrapper_path(&path(), &key.id()), b"\x01garbage")
                .unwrap();
        }
        assert!(matches!(e.decrypt(&path()), Err(StoreError::NoUsableKey(_))));
    }

    #[test]
    fn pem_roundtrip() {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        let (public, private) = &test_pairs()[0];
        let public_pem = public.to_public_key_pem(LineEnding::LF).unwrap();
        let private_pem = private.to_pkcs8_pem(LineEnding::LF).unwrap();
        let key = RecipientKey::from_pem("k", Some(public_pem.as_str()), Some(private_pem.as_str())).unwrap();
        assert!(key.can_encrypt() && key.can_decrypt());
        assert!(matches!(
            RecipientKey::from_pem("k", Some("not a pem"), None),
            Err(StoreError::Configuration(_))
        ));
    }
}
