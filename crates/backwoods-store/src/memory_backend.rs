//! In-memory backend for tests and dry runs.
//!
//! Directories are implicit: a path exists while some object lives at or below it.

use crate::communicator::CommunicatorBackend;
use crate::error::{StoreError, StoreResult};
use crate::path::StoragePath;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    modified: SystemTime,
}

/// Backend holding every object in a sorted map
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<StoragePath, MemoryObject>>,
}

impl MemoryBackend {
    /// Empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the modification time of every object at or below `prefix` back by `by`.
    pub fn backdate(&self, prefix: &StoragePath, by: Duration) {
        let mut objects = self.objects.write();
        for (path, object) in objects.iter_mut() {
            if path.starts_with(prefix) {
                object.modified = object.modified.checked_sub(by).unwrap_or(SystemTime::UNIX_EPOCH);
            }
        }
    }

    /// Every stored object path, sorted
    pub fn paths(&self) -> Vec<StoragePath> {
        self.objects.read().keys().cloned().collect()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl CommunicatorBackend for MemoryBackend {
    fn upload(&self, path: &StoragePath, data: &[u8]) -> StoreResult<()> {
        self.objects.write().insert(
            path.clone(),
            MemoryObject {
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn download(&self, path: &StoragePath) -> StoreResult<Vec<u8>> {
        self.objects
            .read()
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::NotFound(path.clone()))
    }

    fn exists(&self, path: &StoragePath) -> StoreResult<bool> {
        Ok(self.objects.read().keys().any(|k| k.starts_with(path)))
    }

    fn delete(&self, path: &StoragePath) -> StoreResult<()> {
        self.objects.write().retain(|k, _| !k.starts_with(path));
        Ok(())
    }

    fn list(&self, path: &StoragePath, depth: usize) -> StoreResult<Vec<StoragePath>> {
        let objects = self.objects.read();
        let entries: BTreeSet<StoragePath> = objects
            .keys()
            .filter_map(|k| k.truncate_below(path, depth))
            .filter(|entry| entry != path)
            .collect();
        Ok(entries.into_iter().collect())
    }

    fn date(&self, path: &StoragePath) -> StoreResult<SystemTime> {
        self.objects
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(path))
            .map(|(_, o)| o.modified)
            .max()
            .ok_or_else(|| StoreError::NotFound(path.clone()))
    }
}
