//! Shared fixtures for the integration tests

#![allow(dead_code)]

use backwoods_store::{
    AsymmetricRsaEngine, BackupOptions, BackupWriter, ChecksumEngine, CleanerConfig, Communicator,
    CompressionEngine, EncryptionEngine, MemoryBackend, NoneEngine, RecipientKey, StoragePath,
    SymmetricAlgorithm,
};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const DAY: Duration = Duration::from_secs(24 * 3600);

pub fn memory_store() -> (Arc<MemoryBackend>, Communicator) {
    let backend = Arc::new(MemoryBackend::new());
    let communicator = Communicator::new(backend.clone());
    (backend, communicator)
}

pub fn none_engine(communicator: &Communicator) -> EncryptionEngine {
    EncryptionEngine::None(NoneEngine::new(communicator.clone()))
}

/// Three 1024-bit key pairs, generated once per test binary
pub fn key_pairs() -> &'static [(RsaPublicKey, RsaPrivateKey)] {
    static PAIRS: OnceLock<Vec<(RsaPublicKey, RsaPrivateKey)>> = OnceLock::new();
    PAIRS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        (0..3)
            .map(|_| {
                let private = RsaPrivateKey::new(&mut rng, 1024).expect("generate key");
                (RsaPublicKey::from(&private), private)
            })
            .collect()
    })
}

pub fn recipient(name: &str, idx: usize) -> RecipientKey {
    let (public, private) = key_pairs()[idx].clone();
    RecipientKey::new(name, Some(public), Some(private))
}

pub fn rsa_engine(communicator: &Communicator, keys: Vec<RecipientKey>) -> EncryptionEngine {
    EncryptionEngine::AsymmetricRsa(
        AsymmetricRsaEngine::new(communicator.clone(), keys, SymmetricAlgorithm::default())
            .expect("engine"),
    )
}

pub fn cleaner_config(min_set_manifests: usize) -> CleanerConfig {
    CleanerConfig {
        min_block_age: DAY,
        min_manifest_age: 7 * DAY,
        min_set_manifests,
        workers: 3,
        verify_block_checksums: true,
    }
}

/// Back up `paths` into a manifest stamped `stamp` and upload it.
pub fn back_up(engine: &EncryptionEngine, stamp: u64, chunk_size: usize, paths: &[&Path]) -> StoragePath {
    let mut writer = BackupWriter::new(
        BackupOptions {
            host: "host1".into(),
            set_name: "nightly".into(),
            chunk_size,
            path_exclusions: Vec::new(),
            stamp: Some(stamp),
        },
        ChecksumEngine::default(),
        CompressionEngine::default(),
        engine.clone(),
        engine.clone(),
    )
    .expect("writer");
    for path in paths {
        writer.backup_path(path).expect("backup");
    }
    writer.finish().expect("finish").0
}

/// Set the modification time of every file below `root` to `by` ago.
pub fn age_files(root: &Path, by: Duration) {
    let when = std::time::SystemTime::now() - by;
    for entry in std::fs::read_dir(root).expect("read_dir") {
        let path = entry.expect("entry").path();
        if path.is_dir() {
            age_files(&path, by);
        } else {
            std::fs::File::options()
                .write(true)
                .open(&path)
                .and_then(|f| f.set_modified(when))
                .expect("set mtime");
        }
    }
}
