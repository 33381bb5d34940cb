//! Store configuration, loaded from TOML or JSON

use crate::asymmetric::{AsymmetricRsaEngine, RecipientKey};
use crate::backup::{BackupOptions, DEFAULT_CHUNK_SIZE};
use crate::checksum::{ChecksumAlgorithm, ChecksumEngine};
use crate::cipher::{SymmetricAlgorithm, SymmetricKey};
use crate::cleaner::{default_workers, CleanerConfig};
use crate::communicator::Communicator;
use crate::compression::{CompressionAlgorithm, CompressionEngine};
use crate::encryption::{EncryptionEngine, NoneEngine};
use crate::error::{StoreError, StoreResult};
use crate::fs_backend::FilesystemBackend;
use crate::memory_backend::MemoryBackend;
use crate::symmetric::{SymmetricEngine, SymmetricSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Where objects are stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CommunicatorConfig {
    /// Directory tree rooted at `base_path`
    Filesystem {
        /// Existing root directory
        base_path: PathBuf,
    },
    /// Process-local, empty on every start
    #[default]
    Memory,
}

/// PEM files for one named key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeyConfig {
    /// Needed to encrypt
    #[serde(default)]
    pub public_key: Option<PathBuf>,
    /// Needed to decrypt
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

/// Encryption engine selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EncryptionConfig {
    /// Plain envelopes
    #[default]
    None,
    /// One shared content key read from a hex file
    Symmetric {
        /// AEAD cipher
        #[serde(default)]
        algorithm: SymmetricAlgorithm,
        /// File holding 64 hex characters
        key_file: PathBuf,
    },
    /// Hybrid RSA wrapping
    Rsa {
        /// AEAD cipher for content
        #[serde(default)]
        symmetric_algorithm: SymmetricAlgorithm,
        /// Recipients of both blocks and manifests
        #[serde(default)]
        keys: BTreeMap<String, KeyConfig>,
        /// Additional recipients of manifests only
        #[serde(default)]
        manifest_only_keys: BTreeMap<String, KeyConfig>,
    },
}

/// `[cleaner]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerSection {
    /// See [`CleanerConfig::min_block_age`]
    pub min_block_age_secs: u64,
    /// See [`CleanerConfig::min_manifest_age`]
    pub min_manifest_age_secs: u64,
    /// See [`CleanerConfig::min_set_manifests`]
    pub min_set_manifests: usize,
    /// Worker threads; the CPU count when unset
    pub workers: Option<usize>,
    /// See [`CleanerConfig::verify_block_checksums`]
    pub verify_block_checksums: bool,
}

impl Default for CleanerSection {
    fn default() -> Self {
        let defaults = CleanerConfig::default();
        Self {
            min_block_age_secs: defaults.min_block_age.as_secs(),
            min_manifest_age_secs: defaults.min_manifest_age.as_secs(),
            min_set_manifests: defaults.min_set_manifests,
            workers: None,
            verify_block_checksums: defaults.verify_block_checksums,
        }
    }
}

/// `[backup]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    /// Host component of manifest paths
    pub host: String,
    /// Set component of manifest paths
    pub set_name: String,
    /// Bytes per block
    pub chunk_size: usize,
    /// Regexes of paths to skip
    pub path_exclusions: Vec<String>,
}

impl Default for BackupSection {
    fn default() -> Self {
        let defaults = BackupOptions::default();
        Self {
            host: defaults.host,
            set_name: defaults.set_name,
            chunk_size: DEFAULT_CHUNK_SIZE,
            path_exclusions: Vec::new(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend
    pub communicator: CommunicatorConfig,
    /// Checksum for blocks and manifests
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Compression for blocks and manifests
    pub compression_algorithm: CompressionAlgorithm,
    /// Encryption engine
    pub encryption: EncryptionConfig,
    /// Cleaner thresholds
    pub cleaner: CleanerSection,
    /// Backup defaults
    pub backup: BackupSection,
}

impl StoreConfig {
    /// Load from a `.toml` or `.json` file. Relative paths inside are resolved
    /// against the file's directory.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Configuration(format!("reading {}: {e}", path.display()))
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let mut config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| StoreError::Configuration(format!("{}: {e}", path.display())))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| StoreError::Configuration(format!("{}: {e}", path.display())))?,
            _ => {
                return Err(StoreError::Configuration(format!(
                    "Unsupported config file extension: {ext}"
                )))
            }
        };
        if let Some(dir) = path.parent() {
            config.resolve_relative_paths(dir);
        }
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    fn resolve_relative_paths(&mut self, dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        if let CommunicatorConfig::Filesystem { base_path } = &mut self.communicator {
            resolve(base_path);
        }
        match &mut self.encryption {
            EncryptionConfig::None => {}
            EncryptionConfig::Symmetric { key_file, .. } => resolve(key_file),
            EncryptionConfig::Rsa {
                keys,
                manifest_only_keys,
                ..
            } => {
                for key in keys.values_mut().chain(manifest_only_keys.values_mut()) {
                    key.public_key.iter_mut().for_each(resolve);
                    key.private_key.iter_mut().for_each(resolve);
                }
            }
        }
    }

    /// Open the configured backend.
    pub fn communicator(&self) -> StoreResult<Communicator> {
        Ok(match &self.communicator {
            CommunicatorConfig::Filesystem { base_path } => {
                Communicator::new(Arc::new(FilesystemBackend::new(base_path)?))
            }
            CommunicatorConfig::Memory => Communicator::new(Arc::new(MemoryBackend::new())),
        })
    }

    /// Checksum engine for new blocks and manifests
    pub fn checksum_engine(&self) -> ChecksumEngine {
        ChecksumEngine::new(self.checksum_algorithm)
    }

    /// Compression engine for new blocks and manifests
    pub fn compression_engine(&self) -> CompressionEngine {
        CompressionEngine::new(self.compression_algorithm)
    }

    /// Engine for blocks: data keys only.
    pub fn data_engine(&self, communicator: Communicator) -> StoreResult<EncryptionEngine> {
        self.build_engine(communicator, false)
    }

    /// Engine for manifests: data keys plus manifest-only keys.
    pub fn manifest_engine(&self, communicator: Communicator) -> StoreResult<EncryptionEngine> {
        self.build_engine(communicator, true)
    }

    fn build_engine(&self, communicator: Communicator, with_manifest_keys: bool) -> StoreResult<EncryptionEngine> {
        match &self.encryption {
            EncryptionConfig::None => Ok(EncryptionEngine::None(NoneEngine::new(communicator))),
            EncryptionConfig::Symmetric {
                algorithm,
                key_file,
            } => {
                let key = load_symmetric_key(key_file)?;
                Ok(EncryptionEngine::Symmetric(SymmetricEngine::new(
                    communicator,
                    SymmetricSettings {
                        key,
                        algorithm: *algorithm,
                    },
                )))
            }
            EncryptionConfig::Rsa {
                symmetric_algorithm,
                keys,
                manifest_only_keys,
            } => {
                let mut recipients = Vec::new();
                for (name, key) in keys {
                    recipients.push(load_recipient(name, key)?);
                }
                if with_manifest_keys {
                    for (name, key) in manifest_only_keys {
                        recipients.push(load_recipient(name, key)?);
                    }
                }
                Ok(EncryptionEngine::AsymmetricRsa(AsymmetricRsaEngine::new(
                    communicator,
                    recipients,
                    *symmetric_algorithm,
                )?))
            }
        }
    }

    /// Cleaner thresholds
    pub fn cleaner_config(&self) -> CleanerConfig {
        CleanerConfig {
            min_block_age: Duration::from_secs(self.cleaner.min_block_age_secs),
            min_manifest_age: Duration::from_secs(self.cleaner.min_manifest_age_secs),
            min_set_manifests: self.cleaner.min_set_manifests,
            workers: self.cleaner.workers.unwrap_or_else(default_workers),
            verify_block_checksums: self.cleaner.verify_block_checksums,
        }
    }

    /// Backup options from the `[backup]` section
    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            host: self.backup.host.clone(),
            set_name: self.backup.set_name.clone(),
            chunk_size: self.backup.chunk_size,
            path_exclusions: self.backup.path_exclusions.clone(),
            stamp: None,
        }
    }
}

fn read_key_file(path: &Path) -> StoreResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| StoreError::Configuration(format!("reading key {}: {e}", path.display())))
}

fn load_recipient(name: &str, key: &KeyConfig) -> StoreResult<RecipientKey> {
    let public = key.public_key.as_deref().map(read_key_file).transpose()?;
    let private = key.private_key.as_deref().map(read_key_file).transpose()?;
    if public.is_none() && private.is_none() {
        return Err(StoreError::Configuration(format!("key {name} has neither public nor private key")));
    }
    RecipientKey::from_pem(name, public.as_deref(), private.as_deref())
}

fn load_symmetric_key(path: &Path) -> StoreResult<SymmetricKey> {
    let text = read_key_file(path)?;
    let bytes = hex::decode(text.trim())
        .map_err(|e| StoreError::Configuration(format!("key {}: {e}", path.display())))?;
    SymmetricKey::from_slice(&bytes)
        .map_err(|e| StoreError::Configuration(format!("key {}: {e}", path.display())))
}
