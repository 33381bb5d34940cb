//! Content-addressed blocks stored at `blocks/<checksum>/<length>`

use crate::checksum::{Checksum, ChecksumEngine};
use crate::communicator::Communicator;
use crate::compression::{self, CompressionEngine, CompressionMetadata};
use crate::encryption::EncryptionEngine;
use crate::envelope::Metadata;
use crate::error::{StoreError, StoreResult};
use crate::path::StoragePath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Top-level directory holding every block
pub const BLOCKS_PATH: &str = "blocks";

/// Metadata layout version written with each block
pub const BLOCK_METADATA_VERSION: u64 = 0;

/// Metadata stored beside a compressed payload, shared by blocks and manifests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    /// Layout version
    pub version: u64,
    /// Uncompressed length
    pub length: u64,
    /// Checksum of the uncompressed data
    pub checksum: Checksum,
    /// How the payload was compressed
    pub compression: CompressionMetadata,
}

impl PayloadMetadata {
    /// As an envelope metadata object
    pub fn to_metadata(&self) -> StoreResult<Metadata> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(StoreError::Encode("payload metadata is not an object".into())),
        }
    }

    /// Parse from decrypted envelope metadata, ignoring engine keys.
    pub fn from_metadata(metadata: &Metadata) -> StoreResult<Self> {
        Ok(serde_json::from_value(Value::Object(metadata.clone()))?)
    }

    /// Decompress `payload` and check it against the recorded length and checksum.
    pub fn unpack(&self, expected_version: u64, payload: &[u8]) -> StoreResult<Vec<u8>> {
        if self.version != expected_version {
            return Err(StoreError::Decode(format!(
                "Metadata version mismatch: {}:{}",
                self.version, expected_version
            )));
        }
        let data = compression::decompress(&self.compression, payload)?;
        if data.len() as u64 != self.length {
            return Err(StoreError::ConsistencyViolation(format!(
                "length mismatch: {}:{}",
                data.len(),
                self.length
            )));
        }
        self.checksum.verify_block(&data)?;
        Ok(data)
    }
}

/// Root of the block tree
pub fn blocks_root() -> StoragePath {
    StoragePath::from(BLOCKS_PATH)
}

/// Every block path (`blocks/<checksum>/<length>`), sorted
pub fn list_blocks(communicator: &Communicator) -> StoreResult<Vec<StoragePath>> {
    communicator.list(&blocks_root(), 2)
}

/// One chunk of file data and its checksum
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    data: Vec<u8>,
    checksum: Checksum,
}

impl Block {
    /// Checksum `data` with `engine`
    pub fn new(data: Vec<u8>, engine: &ChecksumEngine) -> Self {
        let checksum = engine.block(&data);
        Self { data, checksum }
    }

    /// Block contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the block, returning its contents
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length block
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Checksum of the contents
    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    /// Storage path; identical content always maps to the same path
    pub fn path(&self) -> StoragePath {
        blocks_root()
            .join(self.checksum.to_string())
            .join(self.data.len().to_string())
    }

    /// True if `engine` can already read this block
    pub fn backed_up(&self, engine: &EncryptionEngine) -> StoreResult<bool> {
        engine.exists(&self.path())
    }

    /// Compress, encrypt and upload the block. Returns the space saved by compression in percent.
    pub fn back_up(&self, engine: &EncryptionEngine, compression: &CompressionEngine) -> StoreResult<f64> {
        let compressed = compression.compress(&self.data)?;
        let metadata = PayloadMetadata {
            version: BLOCK_METADATA_VERSION,
            length: self.data.len() as u64,
            checksum: self.checksum.clone(),
            compression: compressed.metadata,
        };
        engine.encrypt(&self.path(), &compressed.payload, &metadata.to_metadata()?)?;
        debug!(path = %self.path(), percent = compressed.compression_percent(), "uploaded block");
        Ok(compressed.compression_percent())
    }

    /// Download, decrypt and verify the block at `path`.
    pub fn restore(path: &StoragePath, engine: &EncryptionEngine) -> StoreResult<Block> {
        let envelope = engine.decrypt(path)?;
        let metadata = PayloadMetadata::from_metadata(&envelope.metadata)?;
        let data = metadata.unpack(BLOCK_METADATA_VERSION, &envelope.payload)?;
        let block = Block::new(data, &metadata.checksum.engine());
        if block.path() != *path {
            return Err(StoreError::ConsistencyViolation(format!(
                "Block stored at {path} belongs at {}",
                block.path()
            )));
        }
        Ok(block)
    }
}
