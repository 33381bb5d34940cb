//! Zlib, LZ4 and Zstd compression for blocks and manifests

use crate::error::{StoreError, StoreResult};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// Zlib (deflate), the on-disk default
    #[default]
    Zlib,
    /// LZ4 frame format, fastest
    Lz4,
    /// Zstandard, best ratio
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

/// Stored next to a compressed payload so it can be decompressed and length-checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMetadata {
    /// Algorithm used
    pub algorithm: CompressionAlgorithm,
    /// Length of the compressed payload
    pub compressed_length: u64,
    /// Length of the original data
    pub uncompressed_length: u64,
}

/// Compressed payload plus its metadata
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// Compressed bytes
    pub payload: Vec<u8>,
    /// Metadata describing `payload`
    pub metadata: CompressionMetadata,
}

impl CompressionResult {
    /// Space saved, as a percentage of the uncompressed length
    pub fn compression_percent(&self) -> f64 {
        if self.metadata.uncompressed_length == 0 {
            return 0.0;
        }
        100.0
            - (self.metadata.compressed_length as f64
                / self.metadata.uncompressed_length as f64
                * 100.0)
    }
}

/// Compresses with one configured algorithm
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionEngine {
    algorithm: CompressionAlgorithm,
}

impl CompressionEngine {
    /// Create an engine for `algorithm`
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Algorithm this engine produces
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Compress `data`, recording both lengths.
    pub fn compress(&self, data: &[u8]) -> StoreResult<CompressionResult> {
        let payload = compress(data, self.algorithm)?;
        Ok(CompressionResult {
            metadata: CompressionMetadata {
                algorithm: self.algorithm,
                compressed_length: payload.len() as u64,
                uncompressed_length: data.len() as u64,
            },
            payload,
        })
    }
}

/// Decompress `data` described by `metadata`, failing if either length disagrees.
pub fn decompress(metadata: &CompressionMetadata, data: &[u8]) -> StoreResult<Vec<u8>> {
    if data.len() as u64 != metadata.compressed_length {
        return Err(StoreError::DecompressionFailed(format!(
            "compressed length mismatch: {}:{}",
            data.len(),
            metadata.compressed_length
        )));
    }
    let out = decompress_raw(data, metadata.algorithm, metadata.uncompressed_length)?;
    if out.len() as u64 != metadata.uncompressed_length {
        return Err(StoreError::DecompressionFailed(format!(
            "uncompressed length mismatch: {}:{}",
            out.len(),
            metadata.uncompressed_length
        )));
    }
    Ok(out)
}

fn compress(data: &[u8], algo: CompressionAlgorithm) -> StoreResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zlib => {
            let mut out = Vec::new();
            ZlibEncoder::new(data, flate2::Compression::default())
                .read_to_end(&mut out)
                .map_err(|e| StoreError::CompressionFailed(e.to_string()))?;
            Ok(out)
        }
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| StoreError::CompressionFailed(e.to_string()))
        }
    }
}

// Output is capped one byte past `expected` so an oversized stream is caught
// by the length check without being fully inflated.
fn decompress_raw(data: &[u8], algo: CompressionAlgorithm, expected: u64) -> StoreResult<Vec<u8>> {
    let failed = |e: std::io::Error| StoreError::DecompressionFailed(e.to_string());
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zlib => {
            let mut out = Vec::new();
            ZlibDecoder::new(data)
                .take(expected.saturating_add(1))
                .read_to_end(&mut out)
                .map_err(failed)?;
            Ok(out)
        }
        CompressionAlgorithm::Lz4 => {
            if data.len() < 4 {
                return Err(StoreError::DecompressionFailed(
                    "lz4 payload shorter than its size prefix".into(),
                ));
            }
            let (prefix, block) = data.split_at(4);
            let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
            if declared != expected {
                return Err(StoreError::DecompressionFailed(format!(
                    "uncompressed length mismatch: {declared}:{expected}"
                )));
            }
            let size = usize::try_from(expected)
                .map_err(|_| StoreError::DecompressionFailed(format!("block too large: {expected}")))?;
            lz4_flex::decompress(block, size).map_err(|e| StoreError::DecompressionFailed(e.to_string()))
        }
        CompressionAlgorithm::Zstd { .. } => {
            let mut out = Vec::new();
            zstd::stream::read::Decoder::new(data)
                .map_err(failed)?
                .take(expected.saturating_add(1))
                .read_to_end(&mut out)
                .map_err(failed)?;
            Ok(out)
        }
    }
}
