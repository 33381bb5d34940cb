//! Encryption engine selection and dispatch.
//!
//! Every engine writes below `<path>/<tag>/`, where the tag names the engine.
//! Consistency passes read the tags back to pick a keyless engine per object.

use crate::asymmetric::AsymmetricRsaEngine;
use crate::communicator::Communicator;
use crate::envelope::{Envelope, Metadata};
use crate::error::{StoreError, StoreResult};
use crate::path::StoragePath;
use crate::symmetric::SymmetricEngine;
use std::fmt;
use tracing::warn;

/// Metadata key reserved for engine bookkeeping
pub const ENCRYPTION_METADATA_KEY: &str = "encryption";

/// Engine type, stored as the first path component below an object path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncryptionKind {
    /// Plain envelope
    None,
    /// Single-key AEAD
    Symmetric,
    /// Per-recipient RSA wrapping of a shared content key
    AsymmetricRsa,
}

impl EncryptionKind {
    /// Directory name for this engine
    pub fn tag(&self) -> &'static str {
        match self {
            EncryptionKind::None => "None",
            EncryptionKind::Symmetric => "Symmetric",
            EncryptionKind::AsymmetricRsa => "ASymmetricRSA",
        }
    }

    /// Strict parse of a directory name; unknown tags are a configuration error.
    pub fn from_tag(tag: &[u8]) -> StoreResult<Self> {
        match tag {
            b"None" => Ok(EncryptionKind::None),
            b"Symmetric" => Ok(EncryptionKind::Symmetric),
            b"ASymmetricRSA" => Ok(EncryptionKind::AsymmetricRsa),
            other => Err(StoreError::Configuration(format!(
                "Unknown encryption engine {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Engine types present under `path`, in listing order
    pub fn resolve(communicator: &Communicator, path: &StoragePath) -> StoreResult<Vec<Self>> {
        communicator
            .list(path, 1)?
            .iter()
            .map(|entry| {
                Self::from_tag(entry.basename()).map_err(|e| match e {
                    StoreError::Configuration(msg) => {
                        StoreError::Configuration(format!("{msg} for path {path}"))
                    }
                    other => other,
                })
            })
            .collect()
    }
}

impl fmt::Display for EncryptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// True if `object` exists and, when `verify_payload` is set, decodes with an intact payload.
/// Corrupt envelopes count as absent; other failures propagate.
pub(crate) fn object_is_sound(
    communicator: &Communicator,
    object: &StoragePath,
    verify_payload: bool,
) -> StoreResult<bool> {
    if !communicator.exists(object)? {
        return Ok(false);
    }
    if !verify_payload {
        return Ok(true);
    }
    match communicator.download(object, true) {
        Ok(_) => Ok(true),
        Err(e) if e.is_corruption() => {
            warn!(path = %object, error = %e, "stored object failed verification");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Unencrypted engine: the envelope lands at `<path>/None/data.bin`
#[derive(Debug, Clone)]
pub struct NoneEngine {
    communicator: Communicator,
}

impl NoneEngine {
    const OBJECT_NAME: &'static str = "data.bin";

    /// Engine over `communicator`
    pub fn new(communicator: Communicator) -> Self {
        Self { communicator }
    }

    /// Location of the envelope for `path`
    pub fn object_path(path: &StoragePath) -> StoragePath {
        path.join(EncryptionKind::None.tag()).join(Self::OBJECT_NAME)
    }

    /// Store `payload` and `metadata` as is.
    pub fn encrypt(&self, path: &StoragePath, payload: &[u8], metadata: &Metadata) -> StoreResult<()> {
        self.communicator.upload(&Self::object_path(path), metadata, payload)
    }

    /// Fetch the stored envelope.
    pub fn decrypt(&self, path: &StoragePath) -> StoreResult<Envelope> {
        self.communicator.download(&Self::object_path(path), false)
    }

    /// True if the envelope exists.
    pub fn exists(&self, path: &StoragePath) -> StoreResult<bool> {
        self.communicator.exists(&Self::object_path(path))
    }

    /// True if the envelope is present (and intact, with `verify_payload`); otherwise `path` is deleted.
    pub fn ensure_consistent(&self, path: &StoragePath, verify_payload: bool) -> StoreResult<bool> {
        if object_is_sound(&self.communicator, &Self::object_path(path), verify_payload)? {
            return Ok(true);
        }
        warn!(path = %path, "No plain block data, removing");
        self.communicator.delete(path)?;
        Ok(false)
    }
}

/// One of the engines, chosen at configuration time or resolved from a storage tag
#[derive(Debug, Clone)]
pub enum EncryptionEngine {
    /// See [`NoneEngine`]
    None(NoneEngine),
    /// See [`SymmetricEngine`]
    Symmetric(SymmetricEngine),
    /// See [`AsymmetricRsaEngine`]
    AsymmetricRsa(AsymmetricRsaEngine),
}

impl EncryptionEngine {
    /// Engine of `kind` without any keys, able to run existence and consistency checks
    pub fn keyless(kind: EncryptionKind, communicator: Communicator) -> Self {
        match kind {
            EncryptionKind::None => EncryptionEngine::None(NoneEngine::new(communicator)),
            EncryptionKind::Symmetric => {
                EncryptionEngine::Symmetric(SymmetricEngine::keyless(communicator))
            }
            EncryptionKind::AsymmetricRsa => {
                EncryptionEngine::AsymmetricRsa(AsymmetricRsaEngine::keyless(communicator))
            }
        }
    }

    /// Engine type
    pub fn kind(&self) -> EncryptionKind {
        match self {
            EncryptionEngine::None(_) => EncryptionKind::None,
            EncryptionEngine::Symmetric(_) => EncryptionKind::Symmetric,
            EncryptionEngine::AsymmetricRsa(_) => EncryptionKind::AsymmetricRsa,
        }
    }

    /// Communicator the engine writes through
    pub fn communicator(&self) -> &Communicator {
        match self {
            EncryptionEngine::None(e) => &e.communicator,
            EncryptionEngine::Symmetric(e) => e.communicator(),
            EncryptionEngine::AsymmetricRsa(e) => e.communicator(),
        }
    }

    /// Encrypt and store `payload` with `metadata` at `path`.
    pub fn encrypt(&self, path: &StoragePath, payload: &[u8], metadata: &Metadata) -> StoreResult<()> {
        match self {
            EncryptionEngine::None(e) => e.encrypt(path, payload, metadata),
            EncryptionEngine::Symmetric(e) => e.encrypt(path, payload, metadata),
            EncryptionEngine::AsymmetricRsa(e) => e.encrypt(path, payload, metadata),
        }
    }

    /// Fetch and decrypt the object at `path`.
    pub fn decrypt(&self, path: &StoragePath) -> StoreResult<Envelope> {
        match self {
            EncryptionEngine::None(e) => e.decrypt(path),
            EncryptionEngine::Symmetric(e) => e.decrypt(path),
            EncryptionEngine::AsymmetricRsa(e) => e.decrypt(path),
        }
    }

    /// True if the object at `path` is readable by this engine's configuration.
    pub fn exists(&self, path: &StoragePath) -> StoreResult<bool> {
        match self {
            EncryptionEngine::None(e) => e.exists(path),
            EncryptionEngine::Symmetric(e) => e.exists(path),
            EncryptionEngine::AsymmetricRsa(e) => e.exists(path),
        }
    }

    /// Repair the object at `path`, returning false if it had to be removed.
    pub fn ensure_consistent(&self, path: &StoragePath, verify_payload: bool) -> StoreResult<bool> {
        match self {
            EncryptionEngine::None(e) => e.ensure_consistent(path, verify_payload),
            EncryptionEngine::Symmetric(e) => e.ensure_consistent(path, verify_payload),
            EncryptionEngine::AsymmetricRsa(e) => e.ensure_consistent(path, verify_payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::CommunicatorBackend;
    use crate::memory_backend::MemoryBackend;
    use std::sync::Arc;

    #[test]
    fn tags_roundtrip_strictly() {
        for kind in [EncryptionKind::None, EncryptionKind::Symmetric, EncryptionKind::AsymmetricRsa] {
            assert_eq!(EncryptionKind::from_tag(kind.tag().as_bytes()).unwrap(), kind);
        }
        assert!(matches!(
            EncryptionKind::from_tag(b"asymmetricrsa"),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn none_engine_roundtrip_and_layout() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = EncryptionEngine::None(NoneEngine::new(Communicator::new(backend.clone())));
        let path = StoragePath::from("blocks/x/3");
        engine.encrypt(&path, b"abc", &Metadata::new()).unwrap();
        assert_eq!(backend.paths(), vec![StoragePath::from("blocks/x/3/None/data.bin")]);
        assert_eq!(engine.decrypt(&path).unwrap().payload, b"abc");
        assert!(engine.exists(&path).unwrap());
    }

    #[test]
    fn resolve_reports_every_tag() {
        let backend = Arc::new(MemoryBackend::new());
        let comm = Communicator::new(backend.clone());
        let path = StoragePath::from("obj");
        backend.upload(&path.join("None/data.bin"), b"").unwrap();
        backend.upload(&path.join("Symmetric/sym.bin"), b"").unwrap();
        assert_eq!(
            EncryptionKind::resolve(&comm, &path).unwrap(),
            vec![EncryptionKind::None, EncryptionKind::Symmetric]
        );
        backend.upload(&path.join("Mystery/x"), b"").unwrap();
        assert!(matches!(
            EncryptionKind::resolve(&comm, &path),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn verification_failure_counts_as_absent() {
        let backend = Arc::new(MemoryBackend::new());
        let comm = Communicator::new(backend.clone());
        let path = StoragePath::from("obj");
        let engine = NoneEngine::new(comm.clone());
        engine.encrypt(&path, b"payload", &Metadata::new()).unwrap();

        let object = NoneEngine::object_path(&path);
        let mut raw = backend.download(&object).unwrap();
        let at = raw.len() - 70;
        raw[at] ^= 0x01;
        backend.upload(&object, &raw).unwrap();

        assert!(engine.ensure_consistent(&path, false).unwrap());
        assert!(!engine.ensure_consistent(&path, true).unwrap());
        assert!(backend.is_empty());
    }
}
