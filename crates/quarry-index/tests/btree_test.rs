//! End-to-end tests for the full storage stack:
//! extent store -> buffer pool -> B+tree.

use quarry_buffer::{BufferPool, BufferPoolConfig};
use quarry_common::{ExtentStoreConfig, PageId, QuarryError};
use quarry_index::BTree;
use quarry_storage::ExtentStore;
use std::sync::Arc;
use tempfile::tempdir;

fn open_pool(path: &std::path::Path, num_frames: usize) -> Arc<BufferPool> {
    let store = ExtentStore::open(path).unwrap();
    Arc::new(BufferPool::new(store, BufferPoolConfig { num_frames }).unwrap())
}

#[test]
fn test_tree_round_trip_with_splits_and_deletes() {
    let dir = tempdir().unwrap();
    let store = ExtentStore::create(
        dir.path().join("round_trip.db"),
        ExtentStoreConfig::new(1),
        true,
    )
    .unwrap();
    let pool = Arc::new(BufferPool::new(store, BufferPoolConfig { num_frames: 64 }).unwrap());
    let mut tree: BTree<u64, u64> = BTree::create(pool).unwrap();

    // Interleave the scenario keys with enough bulk to force splits
    // (1 KiB pages hold 60 entries per node).
    for key in [5u64, 1, 9, 3, 7, 2, 8, 4, 6] {
        tree.insert(key, key).unwrap();
    }
    for key in 10..200u64 {
        tree.insert(key, key).unwrap();
    }

    for key in 1..200u64 {
        assert_eq!(tree.get(&key).unwrap(), key);
    }

    let keys: Vec<u64> = tree.iter().unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(keys, (1..200).collect::<Vec<u64>>());

    assert_eq!(tree.remove(&3).unwrap(), 3);
    assert_eq!(tree.remove(&7).unwrap(), 7);
    assert!(matches!(tree.get(&3), Err(QuarryError::KeyNotFound)));
    assert!(matches!(tree.get(&7), Err(QuarryError::KeyNotFound)));
    for key in (1..200u64).filter(|k| *k != 3 && *k != 7) {
        assert_eq!(tree.get(&key).unwrap(), key);
    }
}

#[test]
fn test_tree_survives_flush_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.db");
    let root;

    {
        let store = ExtentStore::create(&path, ExtentStoreConfig::new(1), true).unwrap();
        let pool =
            Arc::new(BufferPool::new(store, BufferPoolConfig { num_frames: 128 }).unwrap());
        let mut tree: BTree<u64, u64> = BTree::create(pool.clone()).unwrap();

        for key in 0..1500u64 {
            tree.insert(key, key * 3).unwrap();
        }
        root = tree.root();

        // Buffer-pool flushing is the durability boundary.
        pool.flush_all().unwrap();
    }

    let pool = open_pool(&path, 128);
    let mut tree: BTree<u64, u64> = BTree::open(pool.clone(), root).unwrap();

    for key in 0..1500u64 {
        assert_eq!(tree.get(&key).unwrap(), key * 3);
    }
    let count = tree.iter().unwrap().count();
    assert_eq!(count, 1500);

    // The reopened tree keeps working: mutate, flush, reopen once more.
    for key in 0..700u64 {
        tree.remove(&key).unwrap();
    }
    let root = tree.root();
    pool.flush_all().unwrap();
    drop(tree);
    drop(pool);

    let pool = open_pool(&path, 128);
    let tree: BTree<u64, u64> = BTree::open(pool, root).unwrap();
    assert!(matches!(tree.get(&100), Err(QuarryError::KeyNotFound)));
    assert_eq!(tree.get(&700).unwrap(), 2100);
    assert_eq!(tree.iter().unwrap().count(), 800);
}

#[test]
fn test_tree_under_eviction_pressure() {
    let dir = tempdir().unwrap();
    let store = ExtentStore::create(
        dir.path().join("evict.db"),
        ExtentStoreConfig::new(1),
        true,
    )
    .unwrap();
    // Far fewer frames than tree pages, so node pages are evicted and
    // faulted back in constantly while the tree is worked.
    let pool = Arc::new(BufferPool::new(store, BufferPoolConfig { num_frames: 8 }).unwrap());
    let mut tree: BTree<u64, u64> = BTree::create(pool).unwrap();

    for key in 0..2000u64 {
        tree.insert(key, !key).unwrap();
    }
    for key in (0..2000u64).step_by(3) {
        assert_eq!(tree.remove(&key).unwrap(), !key);
    }
    for key in 0..2000u64 {
        match tree.get(&key) {
            Ok(value) => {
                assert_ne!(key % 3, 0);
                assert_eq!(value, !key);
            }
            Err(QuarryError::KeyNotFound) => assert_eq!(key % 3, 0),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[test]
fn test_root_id_changes_are_observable() {
    let dir = tempdir().unwrap();
    let store = ExtentStore::create(
        dir.path().join("root.db"),
        ExtentStoreConfig::new(1),
        true,
    )
    .unwrap();
    let pool = Arc::new(BufferPool::new(store, BufferPoolConfig { num_frames: 64 }).unwrap());
    let mut tree: BTree<u64, u64> = BTree::create(pool).unwrap();

    let leaf_root = tree.root();
    assert!(leaf_root.is_valid());
    assert_ne!(leaf_root, PageId::new(0));

    // Growth replaces the root; callers must re-persist the id.
    for key in 0..61u64 {
        tree.insert(key, key).unwrap();
    }
    let grown_root = tree.root();
    assert_ne!(grown_root, leaf_root);

    // Draining the tree shrinks the root back to a single leaf.
    for key in 0..61u64 {
        tree.remove(&key).unwrap();
    }
    let shrunk_root = tree.root();
    assert_ne!(shrunk_root, grown_root);
    assert_eq!(tree.iter().unwrap().count(), 0);
}

#[test]
fn test_two_trees_share_one_pool() {
    let dir = tempdir().unwrap();
    let store = ExtentStore::create(
        dir.path().join("shared.db"),
        ExtentStoreConfig::new(1),
        true,
    )
    .unwrap();
    let pool = Arc::new(BufferPool::new(store, BufferPoolConfig { num_frames: 64 }).unwrap());

    let mut names: BTree<u64, u64> = BTree::create(pool.clone()).unwrap();
    let mut ages: BTree<u32, u32> = BTree::create(pool.clone()).unwrap();

    for key in 0..500u64 {
        names.insert(key, key + 1).unwrap();
    }
    for key in 0..500u32 {
        ages.insert(key, key + 2).unwrap();
    }

    for key in 0..500u64 {
        assert_eq!(names.get(&key).unwrap(), key + 1);
    }
    for key in 0..500u32 {
        assert_eq!(ages.get(&key).unwrap(), key + 2);
    }

    // A tree of one shape refuses pages of the other.
    assert!(matches!(
        BTree::<u32, u32>::open(pool, names.root()),
        Err(QuarryError::CorruptedPage { .. })
    ));
}
