//! Error types for the backwoods storage layer

use crate::path::StoragePath;

/// Result type alias for storage layer operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// All errors that can occur while storing, reading or cleaning backup objects
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An envelope failed metadata or payload checksum verification
    #[error("Verify failed: {0}")]
    Verify(String),
    /// An envelope or stored document could not be parsed
    #[error("Decode failed: {0}")]
    Decode(String),
    /// An envelope field did not fit its length prefix
    #[error("Encode failed: {0}")]
    Encode(String),
    /// Data did not match the expected checksum
    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Checksum recorded alongside the data
        expected: String,
        /// Checksum computed from the data
        actual: String,
    },
    /// Two stored fields that must agree do not (e.g. configured vs stored algorithm)
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),
    /// The storage backend refused or failed an operation
    #[error("Communicator error: {0}")]
    Communicator(String),
    /// A required setting, key or algorithm is missing or unknown
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch; data may be corrupted or tampered
    #[error("Decryption failed: authentication tag mismatch (data may be corrupted)")]
    DecryptionAuthFailed,
    /// None of the configured recipient keys could open the object
    #[error("Unable to decrypt {0} with any available key")]
    NoUsableKey(StoragePath),
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression failed or produced an unexpected length
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Object does not exist in the backend
    #[error("Not found: {0}")]
    NotFound(StoragePath),
    /// A worker task panicked
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors produced by corrupted or unreadable stored objects,
    /// which consistency passes repair instead of propagating.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Verify(_)
                | StoreError::Decode(_)
                | StoreError::ChecksumMismatch { .. }
                | StoreError::Json(_)
                | StoreError::NotFound(_)
        )
    }
}
