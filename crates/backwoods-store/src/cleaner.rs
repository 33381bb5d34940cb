//! Consistency repair and mark-and-sweep reclamation over the whole store.
//!
//! A run has five phases:
//! 1. every block path is checked with the keyless engine named by its tag(s)
//! 2. same for every manifest path
//! 3. mark: manifests are pruned per `(host, set)` and the survivors' blocks collected
//! 4. sweep: unreferenced blocks older than `min_block_age` are deleted
//! 5. empty manifest and block directories are removed
//!
//! Phase 3 must read every retained manifest. Any manifest that cannot be
//! read aborts the run before blocks are swept.

use crate::block::{blocks_root, list_blocks};
use crate::communicator::Communicator;
use crate::encryption::{EncryptionEngine, EncryptionKind};
use crate::error::StoreResult;
use crate::manifest::{list_manifest_backups, list_manifest_hosts, list_manifest_sets, Manifest};
use crate::path::StoragePath;
use crate::pool::WorkerPool;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cleaner thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanerConfig {
    /// Unreferenced blocks this young or younger are kept
    pub min_block_age: Duration,
    /// Manifests younger than this are always kept
    pub min_manifest_age: Duration,
    /// Older manifests kept per `(host, set)`, newest first
    pub min_set_manifests: usize,
    /// Worker threads for the consistency, mark and sweep phases
    pub workers: usize,
    /// Verify envelope payload checksums during consistency phases
    pub verify_block_checksums: bool,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            min_block_age: Duration::from_secs(24 * 3600),
            min_manifest_age: Duration::from_secs(30 * 24 * 3600),
            min_set_manifests: 7,
            workers: default_workers(),
            verify_block_checksums: false,
        }
    }
}

/// Logical CPU count, or 1 if it cannot be determined
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Live counters for one run
#[derive(Debug, Default)]
pub struct CleanStats {
    paths_checked: AtomicU64,
    paths_removed: AtomicU64,
    manifests_kept: AtomicU64,
    manifests_removed: AtomicU64,
    missing_blocks: AtomicU64,
    blocks_live: AtomicU64,
    blocks_retained: AtomicU64,
    blocks_removed: AtomicU64,
    directories_removed: AtomicU64,
}

impl CleanStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> CleanReport {
        CleanReport {
            paths_checked: self.paths_checked.load(Ordering::Relaxed),
            paths_removed: self.paths_removed.load(Ordering::Relaxed),
            manifests_kept: self.manifests_kept.load(Ordering::Relaxed),
            manifests_removed: self.manifests_removed.load(Ordering::Relaxed),
            missing_blocks: self.missing_blocks.load(Ordering::Relaxed),
            blocks_live: self.blocks_live.load(Ordering::Relaxed),
            blocks_retained: self.blocks_retained.load(Ordering::Relaxed),
            blocks_removed: self.blocks_removed.load(Ordering::Relaxed),
            directories_removed: self.directories_removed.load(Ordering::Relaxed),
        }
    }
}

/// Result of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanReport {
    /// Block and manifest paths that passed the consistency phases
    pub paths_checked: u64,
    /// Paths deleted by the consistency phases
    pub paths_removed: u64,
    /// Manifests retained by the mark phase
    pub manifests_kept: u64,
    /// Manifests deleted by the mark phase
    pub manifests_removed: u64,
    /// References from retained manifests to blocks that do not exist
    pub missing_blocks: u64,
    /// Distinct blocks referenced by retained manifests
    pub blocks_live: u64,
    /// Unreferenced blocks kept because they are too young
    pub blocks_retained: u64,
    /// Unreferenced blocks deleted
    pub blocks_removed: u64,
    /// Empty directories deleted
    pub directories_removed: u64,
}

/// Runs the phases against one store
pub struct Cleaner {
    communicator: Communicator,
    manifest_engine: EncryptionEngine,
    config: CleanerConfig,
    stats: Arc<CleanStats>,
}

impl Cleaner {
    /// `manifest_engine` must be able to decrypt every manifest.
    pub fn new(manifest_engine: EncryptionEngine, config: CleanerConfig) -> Self {
        Self {
            communicator: manifest_engine.communicator().clone(),
            manifest_engine,
            config,
            stats: Arc::new(CleanStats::default()),
        }
    }

    /// Thresholds in use
    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> CleanReport {
        self.stats.snapshot()
    }

    /// Full run: consistency, mark, sweep and directory cleanup.
    pub fn clean(&self) -> StoreResult<CleanReport> {
        info!(
            min_block_age_secs = self.config.min_block_age.as_secs(),
            min_manifest_age_secs = self.config.min_manifest_age.as_secs(),
            min_set_manifests = self.config.min_set_manifests,
            workers = self.config.workers,
            "starting clean"
        );
        self.ensure_blocks_consistent()?;
        self.ensure_manifests_consistent()?;
        let live = self.clean_manifests_and_return_blocks()?;
        self.remove_unused_blocks(&live)?;
        self.clean_empty_directories()?;
        let report = self.stats();
        info!(?report, "clean finished");
        Ok(report)
    }

    /// Consistency phases only.
    pub fn check(&self) -> StoreResult<CleanReport> {
        self.ensure_blocks_consistent()?;
        self.ensure_manifests_consistent()?;
        Ok(self.stats())
    }

    /// Phase 1
    pub fn ensure_blocks_consistent(&self) -> StoreResult<()> {
        let paths = list_blocks(&self.communicator)?;
        debug!(count = paths.len(), "checking block consistency");
        self.ensure_consistent_all("block-check", paths)
    }

    /// Phase 2
    pub fn ensure_manifests_consistent(&self) -> StoreResult<()> {
        let paths = list_manifest_backups(&self.communicator)?;
        debug!(count = paths.len(), "checking manifest consistency");
        self.ensure_consistent_all("manifest-check", paths)
    }

    fn ensure_consistent_all(&self, name: &str, paths: Vec<StoragePath>) -> StoreResult<()> {
        let communicator = self.communicator.clone();
        let stats = Arc::clone(&self.stats);
        let verify = self.config.verify_block_checksums;
        let pool = WorkerPool::new(name, self.config.workers, move |path: StoragePath| {
            ensure_path_consistent(&communicator, &stats, &path, verify)
        })?;
        pool.process(paths);
        pool.join()
    }

    /// Phase 3: prune old manifests and return the blocks referenced by the survivors.
    pub fn clean_manifests_and_return_blocks(&self) -> StoreResult<Arc<DashSet<StoragePath>>> {
        let mut to_mark = Vec::new();
        for set_path in list_manifest_sets(&self.communicator)? {
            let mut old = Vec::new();
            for manifest_path in self.communicator.list(&set_path, 1)? {
                let age = self.communicator.age(&manifest_path)?;
                if age < self.config.min_manifest_age {
                    debug!(path = %manifest_path, age_secs = age.as_secs(), "keeping young manifest");
                    to_mark.push(manifest_path);
                } else {
                    old.push((manifest_path, age));
                }
            }

            // Newest first; equal ages keep listing order.
            old.sort_by_key(|(_, age)| *age);
            for (idx, (manifest_path, age)) in old.into_iter().enumerate() {
                if idx < self.config.min_set_manifests {
                    to_mark.push(manifest_path);
                } else {
                    info!(path = %manifest_path, age_secs = age.as_secs(), "Removing old manifest");
                    self.communicator.delete(&manifest_path)?;
                    CleanStats::bump(&self.stats.manifests_removed);
                }
            }
        }

        let live = Arc::new(DashSet::new());
        let engine = self.manifest_engine.clone();
        let stats = Arc::clone(&self.stats);
        let marked = Arc::clone(&live);
        let pool = WorkerPool::new("mark", self.config.workers, move |path: StoragePath| {
            mark_manifest_blocks(&engine, &stats, &marked, &path)
        })?;
        pool.process(to_mark);
        pool.join()?;

        self.stats
            .blocks_live
            .store(live.len() as u64, Ordering::Relaxed);
        Ok(live)
    }

    /// Phase 4: delete unreferenced blocks older than `min_block_age`.
    pub fn remove_unused_blocks(&self, live: &Arc<DashSet<StoragePath>>) -> StoreResult<()> {
        let unused: Vec<StoragePath> = list_blocks(&self.communicator)?
            .into_iter()
            .filter(|path| !live.contains(path))
            .collect();
        debug!(count = unused.len(), "sweeping unreferenced blocks");

        let communicator = self.communicator.clone();
        let stats = Arc::clone(&self.stats);
        let min_age = self.config.min_block_age;
        let pool = WorkerPool::new("sweep", self.config.workers, move |path: StoragePath| {
            let age = communicator.age(&path)?;
            if age <= min_age {
                debug!(path = %path, age_secs = age.as_secs(), "unused block below minimum age");
                CleanStats::bump(&stats.blocks_retained);
            } else {
                info!(path = %path, age_secs = age.as_secs(), "Removing unreferenced block");
                communicator.delete(&path)?;
                CleanStats::bump(&stats.blocks_removed);
            }
            Ok(())
        })?;
        pool.process(unused);
        pool.join()
    }

    /// Phase 5: remove empty manifest backup, set and host directories, then empty block checksum directories.
    pub fn clean_empty_directories(&self) -> StoreResult<()> {
        let levels = [
            list_manifest_backups(&self.communicator)?,
            list_manifest_sets(&self.communicator)?,
            list_manifest_hosts(&self.communicator)?,
        ];
        for level in levels {
            for path in level {
                self.remove_if_empty(&path)?;
            }
        }
        for path in self.communicator.list(&blocks_root(), 1)? {
            self.remove_if_empty(&path)?;
        }
        Ok(())
    }

    fn remove_if_empty(&self, path: &StoragePath) -> StoreResult<()> {
        // Lower levels may already be gone, taking this path with them.
        if !self.communicator.exists(path)? {
            return Ok(());
        }
        if self.communicator.list(path, 1)?.is_empty() {
            debug!(path = %path, "Removing empty directory");
            self.communicator.delete(path)?;
            CleanStats::bump(&self.stats.directories_removed);
        }
        Ok(())
    }
}

fn ensure_path_consistent(
    communicator: &Communicator,
    stats: &CleanStats,
    path: &StoragePath,
    verify: bool,
) -> StoreResult<()> {
    let kinds = EncryptionKind::resolve(communicator, path)?;
    if kinds.is_empty() {
        error!(path = %path, "No block data in path");
        communicator.delete(path)?;
        CleanStats::bump(&stats.paths_removed);
        return Ok(());
    }
    if kinds.len() > 1 {
        warn!(path = %path, kinds = ?kinds, "Multiple encryption methods in use");
    }
    for kind in kinds {
        if !EncryptionEngine::keyless(kind, communicator.clone()).ensure_consistent(path, verify)? {
            CleanStats::bump(&stats.paths_removed);
            return Ok(());
        }
    }
    CleanStats::bump(&stats.paths_checked);
    Ok(())
}

fn mark_manifest_blocks(
    engine: &EncryptionEngine,
    stats: &CleanStats,
    live: &DashSet<StoragePath>,
    path: &StoragePath,
) -> StoreResult<()> {
    let manifest = Manifest::download(path, engine)?;
    let communicator = engine.communicator();
    for block in manifest.referenced_blocks() {
        if live.contains(block) {
            continue;
        }
        if communicator.exists(block)? {
            live.insert(block.clone());
        } else {
            error!(manifest = %path, block = %block, "Manifest incomplete: block missing");
            CleanStats::bump(&stats.missing_blocks);
        }
    }
    CleanStats::bump(&stats.manifests_kept);
    debug!(path = %path, entries = manifest.len(), "marked manifest");
    Ok(())
}
