//! Storage backend abstraction and the envelope-encoding communicator on top of it

use crate::envelope::{self, Envelope, Metadata};
use crate::error::StoreResult;
use crate::path::StoragePath;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::trace;

/// Raw object storage. Local disk, memory and remote object stores are interchangeable behind it.
pub trait CommunicatorBackend: Send + Sync {
    /// Store `data` at `path`, creating intermediate levels and replacing any existing object.
    fn upload(&self, path: &StoragePath, data: &[u8]) -> StoreResult<()>;

    /// Fetch the object at `path`; `StoreError::NotFound` if absent.
    fn download(&self, path: &StoragePath) -> StoreResult<Vec<u8>>;

    /// True if an object or a directory exists at `path`.
    fn exists(&self, path: &StoragePath) -> StoreResult<bool>;

    /// Delete `path` and everything beneath it. Missing paths are a no-op.
    fn delete(&self, path: &StoragePath) -> StoreResult<()>;

    /// Entries exactly `depth` levels below `path`, sorted. Empty if `path` is missing.
    fn list(&self, path: &StoragePath, depth: usize) -> StoreResult<Vec<StoragePath>>;

    /// Latest modification time of the object at `path` or of anything beneath it.
    fn date(&self, path: &StoragePath) -> StoreResult<SystemTime>;
}

/// A backend paired with the envelope codec; every stored object goes through here.
#[derive(Clone)]
pub struct Communicator {
    backend: Arc<dyn CommunicatorBackend>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator").finish_non_exhaustive()
    }
}

impl Communicator {
    /// Wrap `backend`.
    pub fn new(backend: Arc<dyn CommunicatorBackend>) -> Self {
        Self { backend }
    }

    /// The wrapped backend
    pub fn backend(&self) -> &Arc<dyn CommunicatorBackend> {
        &self.backend
    }

    /// Encode `metadata` and `payload` as an envelope and store it at `path`.
    pub fn upload(&self, path: &StoragePath, metadata: &Metadata, payload: &[u8]) -> StoreResult<()> {
        let encoded = envelope::encode(metadata, payload)?;
        trace!(path = %path, bytes = encoded.len(), "uploading envelope");
        self.backend.upload(path, &encoded)
    }

    /// Download and decode the envelope at `path`.
    pub fn download(&self, path: &StoragePath, verify_payload_checksum: bool) -> StoreResult<Envelope> {
        let raw = self.backend.download(path)?;
        trace!(path = %path, bytes = raw.len(), verify_payload_checksum, "downloaded envelope");
        envelope::decode(&raw, verify_payload_checksum)
    }

    /// See [`CommunicatorBackend::exists`]
    pub fn exists(&self, path: &StoragePath) -> StoreResult<bool> {
        self.backend.exists(path)
    }

    /// See [`CommunicatorBackend::delete`]
    pub fn delete(&self, path: &StoragePath) -> StoreResult<()> {
        self.backend.delete(path)
    }

    /// See [`CommunicatorBackend::list`]
    pub fn list(&self, path: &StoragePath, depth: usize) -> StoreResult<Vec<StoragePath>> {
        self.backend.list(path, depth)
    }

    /// See [`CommunicatorBackend::date`]
    pub fn date(&self, path: &StoragePath) -> StoreResult<SystemTime> {
        self.backend.date(path)
    }

    /// Time since `path` last changed. Dates in the future count as age zero.
    pub fn age(&self, path: &StoragePath) -> StoreResult<Duration> {
        let date = self.backend.date(path)?;
        Ok(SystemTime::now()
            .duration_since(date)
            .unwrap_or(Duration::ZERO))
    }
}
