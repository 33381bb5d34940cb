//! Local filesystem backend rooted at a base directory

use crate::communicator::CommunicatorBackend;
use crate::error::{StoreError, StoreResult};
use crate::path::StoragePath;
use std::ffi::OsStr;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Backend storing each object as a file below `root`.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Open a backend rooted at `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        let meta = fs::metadata(root).map_err(|e| {
            StoreError::Configuration(format!("base path {} is unusable: {e}", root.display()))
        })?;
        if !meta.is_dir() {
            return Err(StoreError::Configuration(format!(
                "base path {} is not a directory",
                root.display()
            )));
        }
        // Canonicalize so symlinked roots resolve to one location.
        let root = fs::canonicalize(root)?;
        debug!(root = %root.display(), "opened filesystem backend");
        Ok(Self { root })
    }

    /// Base directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject storage keys that could escape the root.
    fn validate_key(path: &StoragePath) -> StoreResult<()> {
        if path.is_absolute() {
            return Err(StoreError::Communicator(format!(
                "unsafe storage key: absolute path '{path}'"
            )));
        }
        for component in path.components() {
            if component == b".." || component == b"." {
                return Err(StoreError::Communicator(format!(
                    "unsafe storage key: relative component in '{path}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, path: &StoragePath) -> StoreResult<PathBuf> {
        Self::validate_key(path)?;
        Ok(path
            .components()
            .fold(self.root.clone(), |acc, c| acc.join(OsStr::from_bytes(c))))
    }

    /// Write to a temp file beside the target, then rename into place.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> StoreResult<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn list_recursive(
        dir: &Path,
        prefix: &StoragePath,
        remaining: usize,
        out: &mut Vec<StoragePath>,
    ) -> StoreResult<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let child = prefix.join(name.as_bytes());
            if remaining == 1 {
                out.push(child);
            } else if entry.file_type()?.is_dir() {
                Self::list_recursive(&entry.path(), &child, remaining - 1, out)?;
            }
        }
        Ok(())
    }

    // Latest file mtime in the subtree; a directory with no files reports its own.
    fn newest_mtime(path: &Path) -> StoreResult<Option<SystemTime>> {
        let meta = fs::symlink_metadata(path)?;
        if !meta.is_dir() {
            return Ok(Some(meta.modified()?));
        }
        let mut newest = None;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if let Some(t) = Self::newest_mtime(&entry.path())? {
                newest = newest.max(Some(t));
            }
        }
        Ok(newest)
    }
}

impl CommunicatorBackend for FilesystemBackend {
    fn upload(&self, path: &StoragePath, data: &[u8]) -> StoreResult<()> {
        let full = self.resolve(path)?;
        match self.atomic_write(&full, data) {
            Err(StoreError::Io(ref e)) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.atomic_write(&full, data)
            }
            other => other,
        }
    }

    fn download(&self, path: &StoragePath) -> StoreResult<Vec<u8>> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(path.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, path: &StoragePath) -> StoreResult<bool> {
        let full = self.resolve(path)?;
        match fs::symlink_metadata(&full) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, path: &StoragePath) -> StoreResult<()> {
        if path.is_empty() {
            return Err(StoreError::Communicator("refusing to delete the backend root".into()));
        }
        let full = self.resolve(path)?;
        let result = match fs::symlink_metadata(&full) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full),
            Ok(_) => fs::remove_file(&full),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, path: &StoragePath, depth: usize) -> StoreResult<Vec<StoragePath>> {
        if depth == 0 {
            return Ok(Vec::new());
        }
        let full = self.resolve(path)?;
        match fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => {
                let mut out = Vec::new();
                Self::list_recursive(&full, path, depth, &mut out)?;
                out.sort();
                Ok(out)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn date(&self, path: &StoragePath) -> StoreResult<SystemTime> {
        let full = self.resolve(path)?;
        match Self::newest_mtime(&full) {
            Ok(Some(t)) => Ok(t),
            Ok(None) => Ok(fs::metadata(&full)?.modified()?),
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.clone()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> StoragePath {
        StoragePath::from(s)
    }

    fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(FilesystemBackend::validate_key(&p("/etc/passwd")).is_err());
        assert!(FilesystemBackend::validate_key(&p("../../outside")).is_err());
        assert!(FilesystemBackend::validate_key(&p("foo/../../etc/passwd")).is_err());
        assert!(FilesystemBackend::validate_key(&p("blocks/ab/10")).is_ok());
    }

    #[test]
    fn missing_root_is_configuration_error() {
        let err = FilesystemBackend::new("/definitely/not/here").unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn upload_creates_parents_and_roundtrips() {
        let (_dir, b) = backend();
        b.upload(&p("manifests/host/set/100"), b"m").unwrap();
        assert_eq!(b.download(&p("manifests/host/set/100")).unwrap(), b"m");
        assert!(b.exists(&p("manifests/host")).unwrap());
        assert!(matches!(b.download(&p("manifests/nope")), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_depth_and_empty_dirs() {
        let (dir, b) = backend();
        b.upload(&p("manifests/h1/s1/1"), b"").unwrap();
        b.upload(&p("manifests/h1/s2/2"), b"").unwrap();
        fs::create_dir_all(dir.path().join("manifests/h2/empty")).unwrap();
        assert_eq!(
            b.list(&p("manifests"), 2).unwrap(),
            vec![p("manifests/h1/s1"), p("manifests/h1/s2"), p("manifests/h2/empty")]
        );
        assert_eq!(b.list(&p("manifests"), 3).unwrap(), vec![p("manifests/h1/s1/1"), p("manifests/h1/s2/2")]);
        assert!(b.list(&p("nothing"), 1).unwrap().is_empty());
    }

    #[test]
    fn delete_directory_recursively() {
        let (_dir, b) = backend();
        b.upload(&p("blocks/aa/10/None/data.bin"), b"x").unwrap();
        b.delete(&p("blocks/aa")).unwrap();
        b.delete(&p("blocks/aa")).unwrap();
        assert!(!b.exists(&p("blocks/aa")).unwrap());
        assert!(b.exists(&p("blocks")).unwrap());
        assert!(b.delete(&p("")).is_err());
    }

    #[test]
    fn non_utf8_names_roundtrip() {
        let (_dir, b) = backend();
        let key = p("odd").join([b'n', 0xff, b'x']);
        b.upload(&key, b"data").unwrap();
        assert_eq!(b.list(&p("odd"), 1).unwrap(), vec![key.clone()]);
        assert_eq!(b.download(&key).unwrap(), b"data");
    }

    #[test]
    fn date_reports_newest_descendant() {
        let (_dir, b) = backend();
        b.upload(&p("d/one"), b"1").unwrap();
        let first = b.date(&p("d/one")).unwrap();
        assert!(b.date(&p("d")).unwrap() >= first);
        assert!(matches!(b.date(&p("gone")), Err(StoreError::NotFound(_))));
    }
}
