//! Backup writer: chunks files into deduplicated blocks and records a manifest.

use crate::block::Block;
use crate::checksum::{Checksum, ChecksumEngine};
use crate::compression::CompressionEngine;
use crate::encryption::EncryptionEngine;
use crate::error::{StoreError, StoreResult};
use crate::manifest::{BlockMapEntry, Manifest, StatValues};
use crate::path::StoragePath;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Default chunk size (20 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 20 * 1024 * 1024;

const EFFICIENT_CHUNK_SIZES: std::ops::RangeInclusive<usize> = (128 * 1024)..=(30 * 1024 * 1024);

/// What to back up and how to label it
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Host component of the manifest path
    pub host: String,
    /// Set component of the manifest path
    pub set_name: String,
    /// Bytes per block
    pub chunk_size: usize,
    /// Paths whose string form matches any of these regexes are skipped
    pub path_exclusions: Vec<String>,
    /// Manifest stamp; the current time when `None`
    pub stamp: Option<u64>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            set_name: "default".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            path_exclusions: Vec::new(),
            stamp: None,
        }
    }
}

/// Counters for one backup run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    /// Regular files recorded
    pub files: u64,
    /// Directories recorded
    pub directories: u64,
    /// Symbolic links recorded
    pub symlinks: u64,
    /// Named pipes recorded
    pub fifos: u64,
    /// Paths skipped by an exclusion
    pub excluded: u64,
    /// Blocks compressed, encrypted and uploaded
    pub blocks_uploaded: u64,
    /// Blocks already present in the store
    pub blocks_reused: u64,
    /// File bytes chunked
    pub bytes_read: u64,
    /// Paths that could not be recorded
    pub failures: u64,
}

/// Builds one manifest from a sequence of local paths.
///
/// Per-path problems (unreadable files, unsupported types, files changing
/// mid-read) are logged, counted and mark the manifest partial. Store errors
/// abort the backup.
pub struct BackupWriter {
    checksum: ChecksumEngine,
    compression: CompressionEngine,
    data_engine: EncryptionEngine,
    manifest_engine: EncryptionEngine,
    chunk_size: usize,
    exclusions: Vec<Regex>,
    manifest: Manifest,
    stats: BackupStats,
}

impl BackupWriter {
    /// Writer storing blocks with `data_engine` and the manifest with `manifest_engine`.
    pub fn new(
        options: BackupOptions,
        checksum: ChecksumEngine,
        compression: CompressionEngine,
        data_engine: EncryptionEngine,
        manifest_engine: EncryptionEngine,
    ) -> StoreResult<Self> {
        if options.chunk_size == 0 {
            return Err(StoreError::Configuration("chunk_size must be positive".into()));
        }
        if !EFFICIENT_CHUNK_SIZES.contains(&options.chunk_size) {
            warn!(
                chunk_size = options.chunk_size,
                "Chunk sizes under 128KiB or over 30MiB may increase storage costs or degrade performance"
            );
        }
        let exclusions = options
            .path_exclusions
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    StoreError::Configuration(format!("invalid path exclusion {pattern:?}: {e}"))
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let manifest = match options.stamp {
            Some(stamp) => Manifest::with_stamp(options.host, options.set_name, stamp)?,
            None => Manifest::new(options.host, options.set_name)?,
        };
        Ok(Self {
            checksum,
            compression,
            data_engine,
            manifest_engine,
            chunk_size: options.chunk_size,
            exclusions,
            manifest,
            stats: BackupStats::default(),
        })
    }

    /// Manifest recorded so far
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Counters so far
    pub fn stats(&self) -> BackupStats {
        self.stats
    }

    /// Record `path`, descending into directories.
    pub fn backup_path(&mut self, path: &Path) -> StoreResult<()> {
        let path_str = path.to_string_lossy();
        if self.exclusions.iter().any(|re| re.is_match(&path_str)) {
            info!(path = %path_str, "Skipping path per exclusion list");
            self.stats.excluded += 1;
            return Ok(());
        }

        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) => return self.record_failure(path, &e.to_string()),
        };
        let file_type = meta.file_type();
        let key = StoragePath::new(path.as_os_str().as_bytes());

        if file_type.is_symlink() {
            let target = match fs::read_link(path) {
                Ok(target) => target,
                Err(e) => return self.record_failure(path, &e.to_string()),
            };
            self.manifest
                .create_symlink_entry(key, target.as_os_str().as_bytes().to_vec());
            self.stats.symlinks += 1;
        } else if file_type.is_dir() {
            self.manifest
                .create_directory_entry(key, StatValues::from_metadata(&meta));
            self.stats.directories += 1;
            info!(path = %path_str, "backed up");
            return self.backup_children(path);
        } else if file_type.is_file() {
            let Some((checksum, copy)) = self.snapshot_file(path)? else {
                return Ok(());
            };
            self.backup_file(key, checksum, copy, StatValues::from_metadata(&meta))?;
        } else if file_type.is_fifo() {
            self.manifest
                .create_fifo_entry(key, StatValues::from_metadata(&meta));
            self.stats.fifos += 1;
        } else {
            return self.record_failure(path, "unsupported file type");
        }
        info!(path = %path_str, "backed up");
        Ok(())
    }

    fn backup_children(&mut self, dir: &Path) -> StoreResult<()> {
        let mut children = match fs::read_dir(dir).and_then(|entries| {
            entries
                .map(|entry| entry.map(|e| e.path()))
                .collect::<io::Result<Vec<_>>>()
        }) {
            Ok(children) => children,
            Err(e) => return self.record_failure(dir, &e.to_string()),
        };
        children.sort();
        for child in children {
            self.backup_path(&child)?;
        }
        Ok(())
    }

    /// Checksum `path` and copy it to a private temporary file.
    ///
    /// Returns `None` after recording a failure when the source cannot be read
    /// or changes while it is copied.
    fn snapshot_file(&mut self, path: &Path) -> StoreResult<Option<(Checksum, NamedTempFile)>> {
        match copy_source(&self.checksum, path) {
            Ok((checksum, copy, copied)) if copied == checksum => Ok(Some((checksum, copy))),
            Ok(_) => {
                self.record_failure(path, "changed while being backed up")?;
                Ok(None)
            }
            Err(StoreError::Io(e)) => {
                self.record_failure(path, &e.to_string())?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // Errors from here on come from the local copy or the store and abort the backup.
    fn backup_file(
        &mut self,
        key: StoragePath,
        checksum: Checksum,
        copy: NamedTempFile,
        mut stat: StatValues,
    ) -> StoreResult<()> {
        let copied = copy.as_file().metadata()?.len();
        stat.size = copied;

        let mut reader = copy.reopen()?;
        let mut block_map = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut chunk = Vec::with_capacity(self.chunk_size.min(copied as usize));
            (&mut reader)
                .take(self.chunk_size as u64)
                .read_to_end(&mut chunk)?;
            if chunk.is_empty() {
                break;
            }
            let length = chunk.len() as u64;
            let block = Block::new(chunk, &self.checksum);
            if block.backed_up(&self.data_engine)? {
                debug!(path = %key, offset, length, size = stat.size, "using existing block");
                self.stats.blocks_reused += 1;
            } else {
                let percent = block.back_up(&self.data_engine, &self.compression)?;
                debug!(path = %key, offset, length, size = stat.size, percent, "uploaded new block");
                self.stats.blocks_uploaded += 1;
            }
            block_map.push(BlockMapEntry {
                offset,
                path: block.path(),
            });
            offset += length;
            self.stats.bytes_read += length;
        }

        self.manifest.create_file_entry(key, checksum, stat, block_map);
        self.stats.files += 1;
        Ok(())
    }

    fn record_failure(&mut self, path: &Path, reason: &str) -> StoreResult<()> {
        error!(path = %path.display(), reason, "Failed to back up path");
        self.stats.failures += 1;
        self.manifest.set_partial(true);
        Ok(())
    }

    /// Upload the manifest, returning its storage path and the run's counters.
    pub fn finish(self) -> StoreResult<(StoragePath, BackupStats)> {
        let path = self
            .manifest
            .upload(&self.checksum, &self.manifest_engine, &self.compression)?;
        info!(path = %path, stats = ?self.stats, "backup finished");
        Ok((path, self.stats))
    }
}

fn copy_source(
    engine: &ChecksumEngine,
    path: &Path,
) -> StoreResult<(Checksum, NamedTempFile, Checksum)> {
    let checksum = engine.file(path)?;
    let mut copy = NamedTempFile::new()?;
    io::copy(&mut File::open(path)?, copy.as_file_mut())?;
    let copied = engine.file(copy.path())?;
    Ok((checksum, copy, copied))
}
