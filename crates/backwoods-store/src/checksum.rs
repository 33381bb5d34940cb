//! Content checksums: SHA-256 and BLAKE3 digests with a stable `algorithm:hex` form

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Checksum algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256, the on-disk default and the envelope metadata checksum
    #[default]
    Sha256,
    /// BLAKE3, faster on large blocks
    Blake3,
}

impl ChecksumAlgorithm {
    /// Name used in the `algorithm:digest` string form
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            other => Err(StoreError::Configuration(format!(
                "Unsupported checksum algorithm {other}"
            ))),
        }
    }
}

/// A computed digest tagged with the algorithm that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    /// Algorithm used
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex digest
    pub digest: String,
}

impl Checksum {
    /// Verify `data` hashes to this checksum.
    pub fn verify_block(&self, data: &[u8]) -> StoreResult<()> {
        self.verify_against(ChecksumEngine::new(self.algorithm).block(data))
    }

    /// Verify the file at `path` hashes to this checksum.
    pub fn verify_file(&self, path: &Path) -> StoreResult<()> {
        self.verify_against(ChecksumEngine::new(self.algorithm).file(path)?)
    }

    /// Engine able to reproduce this checksum.
    pub fn engine(&self) -> ChecksumEngine {
        ChecksumEngine::new(self.algorithm)
    }

    fn verify_against(&self, computed: Checksum) -> StoreResult<()> {
        if computed != *self {
            return Err(StoreError::ChecksumMismatch {
                expected: self.to_string(),
                actual: computed.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

impl FromStr for Checksum {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s
            .split_once(':')
            .ok_or_else(|| StoreError::Decode(format!("Malformed checksum {s:?}")))?;
        let algorithm = ChecksumAlgorithm::from_str(algorithm)?;
        // Digests are always written lowercase; anything else is corrupt.
        if digest.is_empty()
            || !digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(StoreError::Decode(format!("Malformed checksum digest {s:?}")));
        }
        Ok(Checksum {
            algorithm,
            digest: digest.to_string(),
        })
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Computes checksums with one configured algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChecksumEngine {
    algorithm: ChecksumAlgorithm,
}

impl ChecksumEngine {
    /// Create an engine for `algorithm`
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Algorithm this engine produces
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Checksum an in-memory block
    pub fn block(&self, data: &[u8]) -> Checksum {
        let digest = match self.algorithm {
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            ChecksumAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
        };
        Checksum {
            algorithm: self.algorithm,
            digest,
        }
    }

    /// Checksum a file by streaming it
    pub fn file(&self, path: &Path) -> StoreResult<Checksum> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = vec![0u8; 64 * 1024];
        let digest = match self.algorithm {
            ChecksumAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hex::encode(hasher.finalize())
            }
            ChecksumAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hasher.finalize().to_hex().to_string()
            }
        };
        Ok(Checksum {
            algorithm: self.algorithm,
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn sha256_known_vector() {
        let c = ChecksumEngine::new(ChecksumAlgorithm::Sha256).block(b"abc");
        assert_eq!(
            c.to_string(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn parse_round_trips_display() {
        let c = ChecksumEngine::new(ChecksumAlgorithm::Blake3).block(b"hello world");
        let parsed: Checksum = c.to_string().parse().unwrap();
        assert_eq!(parsed, c);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("sha256".parse::<Checksum>().is_err());
        assert!("md5:abcd".parse::<Checksum>().is_err());
        assert!("sha256:zz".parse::<Checksum>().is_err());
    }

    #[test]
    fn verify_block_reports_mismatch() {
        let c = ChecksumEngine::default().block(b"hello");
        assert!(c.verify_block(b"hello").is_ok());
        assert!(matches!(
            c.verify_block(b"world"),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn file_matches_block() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        for algo in [ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Blake3] {
            let engine = ChecksumEngine::new(algo);
            assert_eq!(engine.file(file.path()).unwrap(), engine.block(&data));
            engine.block(&data).verify_file(file.path()).unwrap();
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let c = ChecksumEngine::default().block(b"x");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, format!("\"{c}\""));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    proptest! {
        #[test]
        fn prop_checksum_deterministic(data in prop::collection::vec(0u8..=255, 0..10_000)) {
            let engine = ChecksumEngine::default();
            prop_assert_eq!(engine.block(&data), engine.block(&data));
        }
    }
}
