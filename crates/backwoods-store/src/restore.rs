//! Reassemble manifest entries onto a local filesystem

use crate::block::Block;
use crate::checksum::Checksum;
use crate::encryption::EncryptionEngine;
use crate::error::{StoreError, StoreResult};
use crate::manifest::{BlockMapEntry, Manifest, ManifestEntry, StatValues};
use crate::path::StoragePath;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Counters for one restore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStats {
    /// Regular files written
    pub files: u64,
    /// Directories created
    pub directories: u64,
    /// Symbolic links created
    pub symlinks: u64,
    /// Entries not restored (filtered out or unsupported)
    pub skipped: u64,
    /// File bytes written
    pub bytes_written: u64,
}

/// Reads blocks and manifests through one engine and writes them below a target directory
pub struct Restorer {
    engine: EncryptionEngine,
}

impl Restorer {
    /// `engine` must be able to decrypt both the manifest and its blocks.
    pub fn new(engine: EncryptionEngine) -> Self {
        Self { engine }
    }

    /// Restore every entry of the manifest at `manifest_path` below `target`.
    /// With `filter`, only entries whose stored path matches are restored.
    pub fn restore_manifest(
        &self,
        manifest_path: &StoragePath,
        target: &Path,
        filter: Option<&Regex>,
    ) -> StoreResult<RestoreStats> {
        let manifest = Manifest::download(manifest_path, &self.engine)?;
        if manifest.is_partial() {
            warn!(path = %manifest_path, "Restoring from incomplete manifest");
        }
        let mut stats = RestoreStats::default();
        let mut directories = Vec::new();

        // Entries are sorted by path, so parents come before children.
        for (path, entry) in manifest.entries() {
            if let Some(re) = filter {
                if !re.is_match(&path.to_string_lossy()) {
                    debug!(path = %path, "Skipping path per filter");
                    stats.skipped += 1;
                    continue;
                }
            }
            let destination = destination_for(target, path)?;
            reject_symlinked_parents(target, &destination)?;
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            match entry {
                ManifestEntry::File {
                    checksum,
                    stat,
                    block_map,
                } => {
                    stats.bytes_written += self.restore_file_entry(&destination, checksum, stat, block_map)?;
                    stats.files += 1;
                }
                ManifestEntry::Directory { stat } => {
                    if is_symlink(&destination)? {
                        return Err(StoreError::ConsistencyViolation(format!(
                            "Refusing to restore directory {} over a symlink",
                            destination.display()
                        )));
                    }
                    fs::create_dir_all(&destination)?;
                    directories.push((destination, *stat));
                    stats.directories += 1;
                }
                ManifestEntry::Symlink { target: link } => {
                    std::os::unix::fs::symlink(OsStr::from_bytes(link), &destination)?;
                    info!(path = %destination.display(), "Restored");
                    stats.symlinks += 1;
                }
                ManifestEntry::Fifo { .. } => {
                    warn!(path = %path, "Named pipes are not restored");
                    stats.skipped += 1;
                }
            }
        }

        // Deepest first, so read-only parents are locked down last.
        for (destination, stat) in directories.iter().rev() {
            set_attributes(destination, stat)?;
            info!(path = %destination.display(), "Restored");
        }
        info!(manifest = %manifest_path, ?stats, "restore finished");
        Ok(stats)
    }

    /// Write one file from its block map to `destination`, returning the bytes written.
    ///
    /// The file is assembled in a temporary file beside `destination` and only
    /// moved into place once offsets, total size and whole-file checksum agree.
    pub fn restore_file_entry(
        &self,
        destination: &Path,
        checksum: &Checksum,
        stat: &StatValues,
        block_map: &[BlockMapEntry],
    ) -> StoreResult<u64> {
        let dir = destination.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

        let mut offset = 0u64;
        for entry in block_map {
            if entry.offset != offset {
                return Err(StoreError::ConsistencyViolation(format!(
                    "{}: offset mismatch: {}:{}",
                    destination.display(),
                    offset,
                    entry.offset
                )));
            }
            let block = Block::restore(&entry.path, &self.engine)?;
            tmp.write_all(block.data())?;
            offset += block.len() as u64;
            debug!(path = %destination.display(), offset, size = stat.size, "restored block");
        }
        tmp.flush()?;

        if offset != stat.size {
            return Err(StoreError::ConsistencyViolation(format!(
                "{}: size mismatch: {}:{}",
                destination.display(),
                offset,
                stat.size
            )));
        }
        checksum.verify_file(tmp.path())?;

        tmp.persist(destination).map_err(|e| e.error)?;
        set_attributes(destination, stat)?;
        info!(path = %destination.display(), "Restored");
        Ok(offset)
    }
}

/// Local path for stored `path` below `target`. Absolute paths are re-rooted.
fn destination_for(target: &Path, path: &StoragePath) -> StoreResult<PathBuf> {
    let relative = path.relative_from_root().unwrap_or_else(|| path.clone());
    if relative.is_empty() {
        return Ok(target.to_path_buf());
    }
    if relative.components().any(|c| c == b"..") {
        return Err(StoreError::ConsistencyViolation(format!(
            "Refusing to restore {path} outside the target"
        )));
    }
    Ok(target.join(OsStr::from_bytes(relative.as_bytes())))
}

/// Fail if any directory between `target` and `destination` is a symlink,
/// so entries cannot be written through a link restored earlier.
fn reject_symlinked_parents(target: &Path, destination: &Path) -> StoreResult<()> {
    let Ok(relative) = destination.strip_prefix(target) else {
        return Ok(());
    };
    let mut current = target.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(StoreError::ConsistencyViolation(format!(
                    "Refusing to restore {} through symlink {}",
                    destination.display(),
                    current.display()
                )));
            }
            Ok(_) => {}
            // Nothing deeper exists yet.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn is_symlink(path: &Path) -> StoreResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(meta.file_type().is_symlink()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// chown before chmod: changing owner clears setuid/setgid bits.
fn set_attributes(path: &Path, stat: &StatValues) -> StoreResult<()> {
    if let Err(e) = std::os::unix::fs::chown(path, Some(stat.uid), Some(stat.gid)) {
        if e.kind() == io::ErrorKind::PermissionDenied {
            debug!(path = %path.display(), uid = stat.uid, gid = stat.gid, "not permitted to restore ownership");
        } else {
            warn!(path = %path.display(), error = %e, "failed to restore ownership");
        }
    }
    fs::set_permissions(path, fs::Permissions::from_mode(stat.permissions()))?;
    Ok(())
}
