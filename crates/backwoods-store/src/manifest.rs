//! Per-run backup manifests stored at `manifests/<host>/<set_name>/<stamp>`.
//!
//! A manifest maps every backed-up path to a typed entry. It is serialized to
//! JSON, compressed, checksummed and stored through an encryption engine.

use crate::block::PayloadMetadata;
use crate::checksum::{Checksum, ChecksumEngine};
use crate::communicator::Communicator;
use crate::compression::CompressionEngine;
use crate::encryption::EncryptionEngine;
use crate::envelope::Metadata;
use crate::error::{StoreError, StoreResult};
use crate::path::StoragePath;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Top-level directory holding every manifest
pub const MANIFESTS_PATH: &str = "manifests";

/// Manifest document version
pub const MANIFEST_VERSION: u64 = 0;

/// Ownership, permissions and size captured at backup time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatValues {
    /// Full `st_mode`, including file type bits
    pub mode: u32,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
}

impl StatValues {
    /// Capture from filesystem metadata
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
        }
    }

    /// Permission bits only (including setuid, setgid and sticky)
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Where one chunk of a file lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapEntry {
    /// Byte offset of the chunk within the file
    pub offset: u64,
    /// Block path holding the chunk
    pub path: StoragePath,
}

/// One backed-up path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ManifestEntry {
    /// Regular file reassembled from its block map
    File {
        /// Whole-file checksum
        checksum: Checksum,
        /// Captured stat
        stat: StatValues,
        /// Chunks in offset order
        block_map: Vec<BlockMapEntry>,
    },
    /// Directory
    Directory {
        /// Captured stat
        stat: StatValues,
    },
    /// Symbolic link
    Symlink {
        /// Raw link target
        #[serde(with = "base64_bytes")]
        target: Vec<u8>,
    },
    /// Named pipe
    Fifo {
        /// Captured stat
        stat: StatValues,
    },
}

/// A backup run's record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    version: u64,
    stamp: u64,
    host: String,
    set_name: String,
    partial: bool,
    #[serde(default)]
    config: Metadata,
    #[serde(with = "encoded_paths")]
    manifest: BTreeMap<StoragePath, ManifestEntry>,
}

impl Manifest {
    /// Empty manifest stamped with the current time
    pub fn new(host: impl Into<String>, set_name: impl Into<String>) -> StoreResult<Self> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::with_stamp(host, set_name, stamp)
    }

    /// Empty manifest with an explicit stamp
    pub fn with_stamp(host: impl Into<String>, set_name: impl Into<String>, stamp: u64) -> StoreResult<Self> {
        let host = host.into();
        let set_name = set_name.into();
        for (what, value) in [("host", &host), ("set_name", &set_name)] {
            if value.is_empty() || value.contains('/') || value == "." || value == ".." {
                return Err(StoreError::Configuration(format!(
                    "{what} {value:?} must be a single path component"
                )));
            }
        }
        Ok(Self {
            version: MANIFEST_VERSION,
            stamp,
            host,
            set_name,
            partial: false,
            config: Metadata::new(),
            manifest: BTreeMap::new(),
        })
    }

    /// Storage location
    pub fn path(&self) -> StoragePath {
        manifests_root()
            .join(&self.host)
            .join(&self.set_name)
            .join(self.stamp.to_string())
    }

    /// Backup host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Backup set
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// Unix time the run started
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// True if some paths failed during the run
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Flag the run as possibly incomplete
    pub fn set_partial(&mut self, partial: bool) {
        self.partial = partial;
    }

    /// Settings recorded with the run (exclusions and the like)
    pub fn config(&self) -> &Metadata {
        &self.config
    }

    /// Replace the recorded settings
    pub fn set_config(&mut self, config: Metadata) {
        self.config = config;
    }

    /// Entries by path
    pub fn entries(&self) -> impl Iterator<Item = (&StoragePath, &ManifestEntry)> {
        self.manifest.iter()
    }

    /// Entry for `path`
    pub fn entry(&self, path: &StoragePath) -> Option<&ManifestEntry> {
        self.manifest.get(path)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    /// Record a regular file
    pub fn create_file_entry(
        &mut self,
        path: StoragePath,
        checksum: Checksum,
        stat: StatValues,
        block_map: Vec<BlockMapEntry>,
    ) {
        self.manifest.insert(
            path,
            ManifestEntry::File {
                checksum,
                stat,
                block_map,
            },
        );
    }

    /// Record a directory
    pub fn create_directory_entry(&mut self, path: StoragePath, stat: StatValues) {
        self.manifest.insert(path, ManifestEntry::Directory { stat });
    }

    /// Record a symbolic link
    pub fn create_symlink_entry(&mut self, path: StoragePath, target: Vec<u8>) {
        self.manifest.insert(path, ManifestEntry::Symlink { target });
    }

    /// Record a named pipe
    pub fn create_fifo_entry(&mut self, path: StoragePath, stat: StatValues) {
        self.manifest.insert(path, ManifestEntry::Fifo { stat });
    }

    /// Block paths referenced by file entries, in entry order (may repeat)
    pub fn referenced_blocks(&self) -> impl Iterator<Item = &StoragePath> {
        self.manifest.values().flat_map(|entry| match entry {
            ManifestEntry::File { block_map, .. } => block_map.iter().map(|b| &b.path).collect::<Vec<_>>(),
            _ => Vec::new(),
        })
    }

    /// Serialize, compress and encrypt the manifest to [`path`](Self::path).
    pub fn upload(
        &self,
        checksum: &ChecksumEngine,
        encryption: &EncryptionEngine,
        compression: &CompressionEngine,
    ) -> StoreResult<StoragePath> {
        let payload = serde_json::to_vec(self)?;
        let compressed = compression.compress(&payload)?;
        debug!(
            length = payload.len(),
            percent = compressed.compression_percent(),
            "manifest compressed"
        );
        let metadata = PayloadMetadata {
            version: MANIFEST_VERSION,
            length: payload.len() as u64,
            checksum: checksum.block(&payload),
            compression: compressed.metadata,
        };
        let path = self.path();
        encryption.encrypt(&path, &compressed.payload, &metadata.to_metadata()?)?;
        if self.partial {
            warn!(path = %path, "Uploaded incomplete manifest");
        } else {
            info!(path = %path, entries = self.len(), "Uploaded manifest");
        }
        Ok(path)
    }

    /// Download, decrypt and verify the manifest at `path`.
    /// Version, length and checksum failures are reported as decode errors.
    pub fn download(path: &StoragePath, encryption: &EncryptionEngine) -> StoreResult<Manifest> {
        let envelope = encryption.decrypt(path)?;
        let metadata = PayloadMetadata::from_metadata(&envelope.metadata)?;
        let data = metadata
            .unpack(MANIFEST_VERSION, &envelope.payload)
            .map_err(|e| match e {
                StoreError::ChecksumMismatch { expected, actual } => StoreError::Decode(format!(
                    "Manifest checksum mismatch: expected {expected}, computed {actual}"
                )),
                StoreError::DecompressionFailed(msg) | StoreError::ConsistencyViolation(msg) => {
                    StoreError::Decode(format!("Manifest length mismatch: {msg}"))
                }
                other => other,
            })?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Root of the manifest tree
pub fn manifests_root() -> StoragePath {
    StoragePath::from(MANIFESTS_PATH)
}

/// `manifests/<host>` directories
pub fn list_manifest_hosts(communicator: &Communicator) -> StoreResult<Vec<StoragePath>> {
    communicator.list(&manifests_root(), 1)
}

/// `manifests/<host>/<set>` directories
pub fn list_manifest_sets(communicator: &Communicator) -> StoreResult<Vec<StoragePath>> {
    communicator.list(&manifests_root(), 2)
}

/// `manifests/<host>/<set>/<stamp>` object paths
pub fn list_manifest_backups(communicator: &Communicator) -> StoreResult<Vec<StoragePath>> {
    communicator.list(&manifests_root(), 3)
}

// Paths are base64 map keys so names in any encoding survive JSON.
mod encoded_paths {
    use super::*;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<StoragePath, ManifestEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(map.iter().map(|(k, v)| (BASE64.encode(k.as_bytes()), v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<StoragePath, ManifestEntry>, D::Error> {
        let raw = BTreeMap::<String, ManifestEntry>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                BASE64
                    .decode(k.as_bytes())
                    .map(|bytes| (StoragePath::new(bytes), v))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
