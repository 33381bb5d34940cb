#![warn(missing_docs)]

//! Backwoods storage layer: encrypted, content-addressed backup objects
//!
//! Write path: File → Chunk → Checksum → Dedupe → Compress → Encrypt → Envelope → Backend
//! Maintenance: Consistency repair → Mark (manifests) → Sweep (blocks) → Directory cleanup

pub mod asymmetric;
pub mod backup;
pub mod block;
pub mod checksum;
pub mod cipher;
pub mod cleaner;
pub mod communicator;
pub mod compression;
pub mod config;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod fs_backend;
pub mod manifest;
pub mod memory_backend;
pub mod path;
pub mod pool;
pub mod restore;
pub mod symmetric;

pub use asymmetric::{AsymmetricRsaEngine, RecipientKey};
pub use backup::{BackupOptions, BackupStats, BackupWriter};
pub use block::{Block, PayloadMetadata};
pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumEngine};
pub use cipher::{SymmetricAlgorithm, SymmetricKey};
pub use cleaner::{CleanReport, CleanStats, Cleaner, CleanerConfig};
pub use communicator::{Communicator, CommunicatorBackend};
pub use compression::{CompressionAlgorithm, CompressionEngine, CompressionMetadata};
pub use config::StoreConfig;
pub use encryption::{EncryptionEngine, EncryptionKind, NoneEngine};
pub use envelope::{Envelope, Metadata};
pub use error::{StoreError, StoreResult};
pub use fs_backend::FilesystemBackend;
pub use manifest::{BlockMapEntry, Manifest, ManifestEntry, StatValues};
pub use memory_backend::MemoryBackend;
pub use path::StoragePath;
pub use pool::WorkerPool;
pub use restore::{RestoreStats, Restorer};
pub use symmetric::{SymmetricEngine, SymmetricSettings};
