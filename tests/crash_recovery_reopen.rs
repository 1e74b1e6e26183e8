//! Persistence tests
//!
//! A store must reopen with the same objects, free lists and data size,
//! whether it was closed explicitly, dropped, or abandoned without running
//! any destructor (`mem::forget` stands in for a killed process).

use fibstore::{FileStore, Loc, ObjectId, StoreConfig};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn fill(store: &mut FileStore, count: u32) -> BTreeMap<ObjectId, Vec<u8>> {
    let mut expected = BTreeMap::new();
    for i in 0..count {
        let len = 8 + (i as usize * 37) % 900;
        let id = store.new_object(len as u64).unwrap();
        let data: Vec<u8> = (0..len).map(|j| (i as usize + j) as u8).collect();
        store.write_object(id, &data).unwrap();
        expected.insert(id, data);
    }
    expected
}

fn assert_contents(store: &FileStore, expected: &BTreeMap<ObjectId, Vec<u8>>) {
    for (id, data) in expected {
        let block = store.object(*id).unwrap();
        assert_eq!(&block[..data.len()], &data[..], "object {} differs", id);
    }
}

/// No overlapping live blocks, and free plus live bytes cover the data file
fn assert_consistent(store: &FileStore) {
    let mut live: Vec<Loc> = store.objects().map(|(_, loc)| loc).collect();
    live.sort_by_key(|loc| loc.offset());
    for pair in live.windows(2) {
        assert!(!pair[0].overlaps(pair[1]), "{} overlaps {}", pair[0], pair[1]);
    }
    let used: u64 = live.iter().map(|loc| loc.block_bytes()).sum();
    assert_eq!(store.count_free_bytes().unwrap() + used, store.data_size());
}

#[test]
fn test_reopen_after_close() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("close-");

    let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
    let expected = fill(&mut store, 100);
    let data_size = store.data_size();
    let free = store.count_free_bytes().unwrap();
    store.close().unwrap();

    let store = FileStore::load(&prefix, StoreConfig::default()).unwrap();
    assert_eq!(store.data_size(), data_size);
    assert_eq!(store.count_free_bytes().unwrap(), free);
    assert_eq!(store.object_count(), 100);
    assert_contents(&store, &expected);
}

#[test]
fn test_reopen_after_drop() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("drop-");

    let expected = {
        let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
        fill(&mut store, 40)
    };

    let store = FileStore::load(&prefix, StoreConfig::default()).unwrap();
    assert_contents(&store, &expected);
}

#[test]
fn test_handles_survive_reopen_and_recycle() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("handles-");

    {
        let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
        let expected = fill(&mut store, 10);
        for id in expected.keys().filter(|id| id.get() % 2 == 0) {
            store.delete_object(*id).unwrap();
        }
        store.flush().unwrap();
    }

    let mut store = FileStore::load(&prefix, StoreConfig::default()).unwrap();
    let live: Vec<u32> = store.objects().map(|(id, _)| id.get()).collect();
    assert_eq!(live, vec![1, 3, 5, 7, 9]);

    // Freed handles are reused lowest first
    assert_eq!(store.new_object(8).unwrap().get(), 2);
    assert_eq!(store.new_object(8).unwrap().get(), 4);
}

#[test]
fn test_reopen_after_drop_many_growth_steps() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("grown-");

    let (expected, class) = {
        let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
        let expected = fill(&mut store, 600);
        (expected, store.data_size_class())
    };

    let mut store = FileStore::load(&prefix, StoreConfig::default()).unwrap();
    assert_eq!(store.data_size_class(), class);
    assert_contents(&store, &expected);

    // Index table grew past its initial 255 handles and reopened intact
    assert_eq!(store.object_count(), 600);
    let id = store.new_object(16).unwrap();
    assert_eq!(id.get(), 601);
}

#[test]
fn test_reset_then_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("reset-");

    {
        let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
        fill(&mut store, 50);
        store.reset().unwrap();
    }

    let store = FileStore::load(&prefix, StoreConfig::default()).unwrap();
    assert_eq!(store.object_count(), 0);
    assert_eq!(store.data_size(), 440);
    assert_eq!(store.count_free_bytes().unwrap(), 440);
}

#[test]
fn test_create_discards_existing_store() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("recreate-");

    {
        let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
        fill(&mut store, 20);
    }

    let store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
    assert_eq!(store.object_count(), 0);
    assert_eq!(store.data_size(), 440);
}

#[test]
fn test_reopen_after_forget_without_growth() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("forget-");

    let (a, a_loc) = {
        let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
        let a = store.new_object(16).unwrap();
        store.write_object(a, &[b'A'; 16]).unwrap();
        let loc = store.location(a).unwrap();
        std::mem::forget(store);
        (a, loc)
    };

    let mut store = FileStore::load(&prefix, StoreConfig::default()).unwrap();
    assert_eq!(store.data_size(), 440);
    assert_eq!(store.location(a).unwrap(), a_loc);
    assert_consistent(&store);

    let b = store.new_object(16).unwrap();
    assert!(!store.location(b).unwrap().overlaps(a_loc));
    store.write_object(b, &[b'B'; 16]).unwrap();
    assert_eq!(&store.object(a).unwrap()[..16], &[b'A'; 16]);
}

#[test]
fn test_reopen_after_forget_with_growth() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("forget-grown-");

    let (mut expected, class) = {
        let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
        let mut expected = fill(&mut store, 300);
        let doomed: Vec<ObjectId> = expected.keys().copied().step_by(3).collect();
        for id in doomed {
            store.delete_object(id).unwrap();
            expected.remove(&id);
        }
        let class = store.data_size_class();
        std::mem::forget(store);
        (expected, class)
    };

    let mut store = FileStore::load(&prefix, StoreConfig::default()).unwrap();
    assert!(class > 8);
    assert_eq!(store.data_size_class(), class);
    assert_eq!(store.object_count(), expected.len() as u64);
    assert_consistent(&store);
    assert_contents(&store, &expected);

    // New objects must come from genuinely free space
    for i in 0..100u32 {
        let id = store.new_object(64).unwrap();
        store.write_object(id, &[0xEE; 64]).unwrap();
        assert!(!expected.contains_key(&id), "handle {} reissued", i);
    }
    assert_consistent(&store);
    assert_contents(&store, &expected);
}

#[test]
fn test_reopen_after_forget_following_reset() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("forget-reset-");

    {
        let mut store = FileStore::create(&prefix, StoreConfig::default()).unwrap();
        fill(&mut store, 50);
        store.reset().unwrap();
        std::mem::forget(store);
    }

    let store = FileStore::load(&prefix, StoreConfig::default()).unwrap();
    assert_eq!(store.object_count(), 0);
    assert_eq!(store.data_size(), 440);
    assert_eq!(store.count_free_bytes().unwrap(), 440);
}
