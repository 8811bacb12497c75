//! End-to-end tests of the record manager stack: round trips,
//! id stability, recycling, durability, rollback, and close behavior.

use std::path::PathBuf;
use tempfile::tempdir;
use vellum_common::{RecordId, StoreConfig, VellumError, BLOCK_SIZE};
use vellum_store::{BaseRecordManager, RecordManager};

fn test_config() -> StoreConfig {
    StoreConfig {
        fsync_enabled: false,
        ..StoreConfig::default()
    }
}

fn open(base: &PathBuf) -> BaseRecordManager {
    BaseRecordManager::open(base, test_config()).unwrap()
}

#[test]
fn round_trip_small_and_large_records() {
    let dir = tempdir().unwrap();
    let manager = open(&dir.path().join("store"));

    // Small record: fits in one page.
    let small = b"small payload".to_vec();
    let small_id = manager.insert_bytes(&small).unwrap();

    // Large record: several times the block size, exercising the
    // continuation chain.
    let large: Vec<u8> = (0..BLOCK_SIZE * 5 + 321).map(|i| (i % 241) as u8).collect();
    let large_id = manager.insert_bytes(&large).unwrap();

    assert_eq!(manager.fetch_bytes(small_id).unwrap(), small);
    assert_eq!(manager.fetch_bytes(large_id).unwrap(), large);

    // Still intact after more traffic.
    for i in 0..100u32 {
        manager.insert_bytes(&i.to_le_bytes()).unwrap();
    }
    assert_eq!(manager.fetch_bytes(small_id).unwrap(), small);
    assert_eq!(manager.fetch_bytes(large_id).unwrap(), large);
}

#[test]
fn logical_id_stays_stable_across_relocation() {
    let dir = tempdir().unwrap();
    let manager = open(&dir.path().join("store"));

    let id = manager.insert_bytes(&[1u8; 32]).unwrap();

    // Grow far past the original slot's capacity class; the record must
    // move physically while the id keeps resolving.
    let grown = vec![9u8; BLOCK_SIZE * 2];
    manager.update_bytes(id, &grown).unwrap();
    assert_eq!(manager.fetch_bytes(id).unwrap(), grown);

    // Shrink again.
    manager.update_bytes(id, b"tiny").unwrap();
    assert_eq!(manager.fetch_bytes(id).unwrap(), b"tiny");
}

#[test]
fn freed_logical_ids_are_recycled() {
    let dir = tempdir().unwrap();
    let manager = open(&dir.path().join("store"));

    let mut retired = Vec::new();
    for i in 0..10u32 {
        let id = manager.insert_bytes(&i.to_le_bytes()).unwrap();
        retired.push(id);
    }
    for id in &retired {
        manager.delete(*id).unwrap();
    }

    // Subsequent inserts must drain the free-id pool before extending
    // the translation table.
    let mut reused = 0;
    for i in 0..10u32 {
        let id = manager.insert_bytes(&i.to_le_bytes()).unwrap();
        if retired.contains(&id) {
            reused += 1;
        }
    }
    assert_eq!(reused, 10);
}

#[test]
fn commit_survives_simulated_crash() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("store");
    let config = StoreConfig {
        fsync_enabled: false,
        txns_before_sync: 1000, // keep commits in the log only
        ..StoreConfig::default()
    };

    let id;
    let payload: Vec<u8> = (0..10_000).map(|i| (i % 199) as u8).collect();
    {
        let manager = BaseRecordManager::open(&base, config.clone()).unwrap();
        id = manager.insert_bytes(&payload).unwrap();
        manager.commit().unwrap();
        // Simulated crash: the manager is dropped without close() ever
        // writing the blocks to the data file.
        std::mem::forget(manager);
    }

    // Reopen: recovery replays the log into the data file.
    let manager = BaseRecordManager::open(&base, config).unwrap();
    assert_eq!(manager.fetch_bytes(id).unwrap(), payload);
}

#[test]
fn uncommitted_work_is_lost_on_crash() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("store");
    let config = StoreConfig {
        fsync_enabled: false,
        txns_before_sync: 1000,
        ..StoreConfig::default()
    };

    let committed_id;
    let lost_id;
    {
        let manager = BaseRecordManager::open(&base, config.clone()).unwrap();
        committed_id = manager.insert_bytes(b"durable").unwrap();
        manager.commit().unwrap();
        lost_id = manager.insert_bytes(b"never committed").unwrap();
        std::mem::forget(manager);
    }

    let manager = BaseRecordManager::open(&base, config).unwrap();
    assert_eq!(manager.fetch_bytes(committed_id).unwrap(), b"durable");
    assert!(manager.fetch_bytes(lost_id).is_err());
}

#[test]
fn rollback_unresolves_inserted_id() {
    let dir = tempdir().unwrap();
    let manager = open(&dir.path().join("store"));

    let keep = manager.insert_bytes(b"committed baseline").unwrap();
    manager.commit().unwrap();

    let id = manager.insert_bytes(b"speculative").unwrap();
    assert_eq!(manager.fetch_bytes(id).unwrap(), b"speculative");

    manager.rollback().unwrap();
    assert!(matches!(
        manager.fetch_bytes(id),
        Err(VellumError::RecordNotFound { .. }) | Err(VellumError::Corrupted { .. })
    ));
    assert_eq!(manager.fetch_bytes(keep).unwrap(), b"committed baseline");
}

#[test]
fn closed_manager_fails_fast() {
    let dir = tempdir().unwrap();
    let manager = open(&dir.path().join("store"));

    let id = manager.insert_bytes(b"x").unwrap();
    manager.commit().unwrap();
    manager.close().unwrap();

    assert!(matches!(
        manager.insert_bytes(b"y"),
        Err(VellumError::StoreClosed)
    ));
    assert!(matches!(
        manager.fetch_bytes(id),
        Err(VellumError::StoreClosed)
    ));
    assert!(matches!(manager.delete(id), Err(VellumError::StoreClosed)));
    assert!(matches!(manager.rollback(), Err(VellumError::StoreClosed)));
    assert!(matches!(
        manager.get_named("anything"),
        Err(VellumError::StoreClosed)
    ));
}

#[test]
fn roots_and_named_objects_persist() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("store");

    let id;
    {
        let manager = open(&base);
        id = manager.insert_bytes(b"anchored").unwrap();
        manager.set_root(5, id).unwrap();
        manager.set_named("by-name", Some(id)).unwrap();
        manager.commit().unwrap();
        manager.close().unwrap();
    }

    {
        let manager = open(&base);
        assert_eq!(manager.get_root(5).unwrap(), id);
        assert_eq!(manager.get_named("by-name").unwrap(), Some(id));
        assert_eq!(manager.get_named("never-set").unwrap(), None);
        assert_eq!(manager.get_root(6).unwrap(), RecordId::INVALID);
    }
}

#[test]
fn many_records_with_mixed_sizes() {
    let dir = tempdir().unwrap();
    let manager = open(&dir.path().join("store"));

    let mut expected = Vec::new();
    for i in 0..500usize {
        let len = (i * 37) % 3000;
        let data: Vec<u8> = (0..len).map(|j| ((i + j) % 251) as u8).collect();
        let id = manager.insert_bytes(&data).unwrap();
        expected.push((id, data));
    }

    // Delete every third record, then verify the rest.
    for (id, _) in expected.iter().step_by(3) {
        manager.delete(*id).unwrap();
    }
    for (i, (id, data)) in expected.iter().enumerate() {
        if i % 3 == 0 {
            assert!(manager.fetch_bytes(*id).is_err());
        } else {
            assert_eq!(&manager.fetch_bytes(*id).unwrap(), data, "record {}", i);
        }
    }

    manager.commit().unwrap();
    manager.close().unwrap();
}

#[test]
fn bulk_load_mode_round_trips() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("store");

    let ids: Vec<RecordId>;
    {
        let manager = BaseRecordManager::open(&base, StoreConfig::bulk_load()).unwrap();
        ids = (0..50u32)
            .map(|i| manager.insert_bytes(&i.to_le_bytes()).unwrap())
            .collect();
        manager.commit().unwrap();
        manager.close().unwrap();
    }

    let manager = BaseRecordManager::open(&base, StoreConfig::bulk_load()).unwrap();
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(
            manager.fetch_bytes(*id).unwrap(),
            (i as u32).to_le_bytes().to_vec()
        );
    }
}
