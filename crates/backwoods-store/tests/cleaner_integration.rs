//! Mark-and-sweep behaviour of the Cleaner over complete backups

mod common;

use backwoods_store::block::list_blocks;
use backwoods_store::manifest::list_manifest_backups;
use backwoods_store::{
    Block, ChecksumEngine, Cleaner, Communicator, CommunicatorBackend, FilesystemBackend, RecipientKey,
    StoragePath,
};
use common::*;
use std::fs;
use std::sync::Arc;

fn block_path(data: &[u8]) -> StoragePath {
    Block::new(data.to_vec(), &ChecksumEngine::default()).path()
}

fn manifest(stamp: u64) -> StoragePath {
    StoragePath::from(format!("manifests/host1/nightly/{stamp}"))
}

/// Three manifests of one set: the oldest also references `alpha`.
fn three_manifests(engine: &backwoods_store::EncryptionEngine) {
    let dir = tempfile::tempdir().unwrap();
    let alpha = dir.path().join("alpha");
    let bravo = dir.path().join("bravo");
    fs::write(&alpha, b"alpha").unwrap();
    fs::write(&bravo, b"bravo").unwrap();
    back_up(engine, 1, 1024, &[&alpha, &bravo]);
    back_up(engine, 2, 1024, &[&bravo]);
    back_up(engine, 3, 1024, &[&bravo]);
}

#[test]
fn test_young_manifest_and_newest_old_survive() {
    let (backend, comm) = memory_store();
    let engine = none_engine(&comm);
    three_manifests(&engine);
    backend.backdate(&manifest(1), 20 * DAY);
    backend.backdate(&manifest(2), 10 * DAY);
    backend.backdate(&StoragePath::from("blocks"), 2 * DAY);

    let report = Cleaner::new(engine, cleaner_config(1)).clean().unwrap();

    assert_eq!(
        list_manifest_backups(&comm).unwrap(),
        vec![manifest(2), manifest(3)]
    );
    assert_eq!(list_blocks(&comm).unwrap(), vec![block_path(b"bravo")]);
    assert_eq!(report.manifests_removed, 1);
    assert_eq!(report.blocks_removed, 1);
    assert_eq!(report.missing_blocks, 0);
}

#[test]
fn test_all_old_keeps_only_newest() {
    let (backend, comm) = memory_store();
    let engine = none_engine(&comm);
    three_manifests(&engine);
    backend.backdate(&manifest(1), 30 * DAY);
    backend.backdate(&manifest(2), 20 * DAY);
    backend.backdate(&manifest(3), 10 * DAY);
    backend.backdate(&StoragePath::from("blocks"), 2 * DAY);

    Cleaner::new(engine, cleaner_config(1)).clean().unwrap();

    assert_eq!(list_manifest_backups(&comm).unwrap(), vec![manifest(3)]);
    assert_eq!(list_blocks(&comm).unwrap(), vec![block_path(b"bravo")]);
}

#[test]
fn test_blocks_of_deleted_manifests_wait_for_grace_period() {
    let (backend, comm) = memory_store();
    let engine = none_engine(&comm);
    three_manifests(&engine);
    backend.backdate(&manifest(1), 20 * DAY);
    backend.backdate(&manifest(2), 10 * DAY);

    let report = Cleaner::new(engine.clone(), cleaner_config(1)).clean().unwrap();
    assert_eq!(report.blocks_retained, 1);
    assert!(backend.exists(&block_path(b"alpha")).unwrap());

    backend.backdate(&block_path(b"alpha"), 2 * DAY);
    let report = Cleaner::new(engine, cleaner_config(1)).clean().unwrap();
    assert_eq!(report.blocks_removed, 1);
    assert!(!backend.exists(&block_path(b"alpha")).unwrap());
    assert!(backend.exists(&block_path(b"bravo")).unwrap());
}

#[test]
fn test_missing_block_is_reported() {
    let (backend, comm) = memory_store();
    let engine = none_engine(&comm);
    three_manifests(&engine);
    backend.delete(&block_path(b"bravo")).unwrap();

    let report = Cleaner::new(engine, cleaner_config(1)).clean().unwrap();
    assert_eq!(report.missing_blocks, 3);
    assert_eq!(report.manifests_kept, 3);
    assert_eq!(list_manifest_backups(&comm).unwrap().len(), 3);
}

#[test]
fn test_manifest_only_key_can_clean_hybrid_store() {
    let (backend, comm) = memory_store();
    let writer = rsa_engine(&comm, vec![recipient("data", 0), recipient("cleaner", 1)]);
    three_manifests(&writer);
    backend.backdate(&manifest(1), 20 * DAY);
    backend.backdate(&manifest(2), 10 * DAY);
    backend.backdate(&StoragePath::from("blocks"), 2 * DAY);

    let cleaner_key = RecipientKey::new("cleaner", None, Some(key_pairs()[1].1.clone()));
    let report = Cleaner::new(rsa_engine(&comm, vec![cleaner_key]), cleaner_config(1))
        .clean()
        .unwrap();

    assert_eq!(report.manifests_kept, 2);
    assert_eq!(list_blocks(&comm).unwrap(), vec![block_path(b"bravo")]);
}

#[test]
fn test_wrong_manifest_key_aborts_before_sweep() {
    let (backend, comm) = memory_store();
    let writer = rsa_engine(&comm, vec![recipient("data", 0)]);
    three_manifests(&writer);
    backend.backdate(&StoragePath::from("blocks"), 2 * DAY);
    let before = backend.len();

    let stranger = RecipientKey::new("stranger", None, Some(key_pairs()[2].1.clone()));
    assert!(Cleaner::new(rsa_engine(&comm, vec![stranger]), cleaner_config(1))
        .clean()
        .is_err());
    assert_eq!(backend.len(), before);
}

#[test]
fn test_filesystem_store_empty_directories_removed() {
    let root = tempfile::tempdir().unwrap();
    let comm = Communicator::new(Arc::new(FilesystemBackend::new(root.path()).unwrap()));
    let engine = none_engine(&comm);
    three_manifests(&engine);
    age_files(root.path(), 10 * DAY);

    let report = Cleaner::new(engine, cleaner_config(0)).clean().unwrap();

    assert_eq!(report.manifests_removed, 3);
    assert_eq!(report.blocks_removed, 2);
    assert!(!root.path().join("manifests/host1").exists());
    assert!(root.path().join("manifests").exists());
    assert_eq!(fs::read_dir(root.path().join("blocks")).unwrap().count(), 0);
}
