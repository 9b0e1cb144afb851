//! End-to-end exercises of `BPlusTreeIndex` against real files on disk:
//! persistence across reopen, concurrent inserts from multiple threads, and
//! a mixed insert/delete workload big enough to force several splits and
//! merges.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use rand::Rng;

use storage_core::btree::BPlusTreeIndex;
use storage_core::buffer::BufferPool;
use storage_core::column::{decode_int, encode_int, ColumnDescriptor};
use storage_core::disk::DiskManager;
use storage_core::error::StorageError;
use storage_core::rid::Rid;
use storage_core::transaction::Transaction;

fn temp_path(name: &str) -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!(
        "storage_core_it_btree_{}_{}_{:?}",
        name,
        std::process::id(),
        std::thread::current().id()
    ));
    let _ = std::fs::remove_file(&p);
    p
}

#[test]
fn reopening_an_index_preserves_every_entry() {
    storage_core::init_log();
    let path = temp_path("reopen");
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::with_capacity(disk.clone(), 32));
    let cols = vec![ColumnDescriptor::int()];

    {
        let ix = BPlusTreeIndex::create(&path, cols.clone(), disk.clone(), pool.clone()).unwrap();
        let tx = Transaction::new();
        for v in 0..500 {
            ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 0)).unwrap();
        }
        ix.commit(&tx).unwrap();
        pool.flush_all_pages(ix.fd()).unwrap();
    }

    // A fresh disk manager and buffer pool, same underlying file: simulates
    // a process restart rather than just reusing in-memory state.
    let disk2 = Arc::new(DiskManager::new());
    let pool2 = Arc::new(BufferPool::with_capacity(disk2.clone(), 32));
    let reopened = BPlusTreeIndex::open(&path, disk2, pool2).unwrap();
    for v in 0..500 {
        assert_eq!(reopened.get_value(&encode_int(v)).unwrap(), Some(Rid::new(v, 0)));
    }

    let got: Vec<i32> = reopened
        .scan(None)
        .unwrap()
        .map(|r| decode_int(&r.unwrap().0))
        .collect();
    assert_eq!(got, (0..500).collect::<Vec<_>>());
}

#[test]
fn concurrent_inserts_from_multiple_threads_all_land() {
    storage_core::init_log();
    let path = temp_path("concurrent");
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::with_capacity(disk.clone(), 32));
    let cols = vec![ColumnDescriptor::int()];
    let ix = Arc::new(BPlusTreeIndex::create(&path, cols, disk, pool).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let ix = ix.clone();
            thread::spawn(move || {
                let tx = Transaction::new();
                for i in 0..100 {
                    let v = t * 100 + i;
                    ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 0)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for v in 0..800 {
        assert_eq!(ix.get_value(&encode_int(v)).unwrap(), Some(Rid::new(v, 0)));
    }
    let scanned = ix.scan(None).unwrap().count();
    assert_eq!(scanned, 800);
}

#[test]
fn scan_with_lower_bound_skips_everything_before_it() {
    storage_core::init_log();
    let path = temp_path("lower_bound");
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::with_capacity(disk.clone(), 32));
    let cols = vec![ColumnDescriptor::int()];
    let ix = BPlusTreeIndex::create(&path, cols, disk, pool).unwrap();
    let tx = Transaction::new();
    for v in 0..200 {
        ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 0)).unwrap();
    }

    let got: Vec<i32> = ix
        .scan(Some(&encode_int(150)))
        .unwrap()
        .map(|r| decode_int(&r.unwrap().0))
        .collect();
    assert_eq!(got, (150..200).collect::<Vec<_>>());
}

#[test]
fn mixed_insert_and_delete_workload_keeps_tree_consistent() {
    storage_core::init_log();
    let path = temp_path("mixed");
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::with_capacity(disk.clone(), 32));
    let cols = vec![ColumnDescriptor::int()];
    let ix = BPlusTreeIndex::create(&path, cols, disk, pool).unwrap();
    let tx = Transaction::new();

    for v in 0..1000 {
        ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 0)).unwrap();
    }
    // Delete every third entry, then reinsert half of those under new Rids.
    for v in (0..1000).step_by(3) {
        ix.delete_entry(&tx, &encode_int(v)).unwrap();
    }
    ix.commit(&tx).unwrap();
    for v in (0..1000).step_by(6) {
        ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 1)).unwrap();
    }

    for v in 0..1000 {
        let expect = if v % 3 == 0 {
            if v % 6 == 0 { Some(Rid::new(v, 1)) } else { None }
        } else {
            Some(Rid::new(v, 0))
        };
        assert_eq!(ix.get_value(&encode_int(v)).unwrap(), expect, "key {v}");
    }

    let scanned: Vec<i32> = ix
        .scan(None)
        .unwrap()
        .map(|r| decode_int(&r.unwrap().0))
        .collect();
    let mut sorted = scanned.clone();
    sorted.sort();
    assert_eq!(scanned, sorted, "scan must stay in ascending order");
}

fn make_key(i: u32, key_len: usize) -> Vec<u8> {
    let mut v = vec![0u8; key_len];
    v[..4].copy_from_slice(&i.to_be_bytes());
    v
}

/// 1,000 rounds of weighted insert/update/delete over a randomly chosen
/// variable-width string key, checked against a mock sorted map, with a
/// handful of reopens (fresh disk manager and buffer pool, same file)
/// interleaved to make sure persistence doesn't drift from the mock.
#[test]
fn randomized_workload_matches_mock_map_across_reopens() {
    storage_core::init_log();
    let mut rng = rand::thread_rng();
    let key_len: usize = rng.gen_range(4, 260);
    let path = temp_path("randomized");
    let cols = vec![ColumnDescriptor::string(key_len).unwrap()];

    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::with_capacity(disk.clone(), 32));
    let mut ix = BPlusTreeIndex::create(&path, cols, disk, pool.clone()).unwrap();
    let mut tx = Transaction::new();
    let mut mock: BTreeMap<Vec<u8>, Rid> = BTreeMap::new();
    let universe = 64u32;

    for round in 0..1000u32 {
        let key = make_key(rng.gen_range(0, universe), key_len);
        match rng.gen_range(0, 3) {
            0 => {
                // insert
                let rid = Rid::new(round as i32, 0);
                let result = ix.insert_entry(&tx, &key, rid);
                if mock.contains_key(&key) {
                    assert!(matches!(result, Err(StorageError::IndexEntryAlreadyExists)));
                } else {
                    result.unwrap();
                    mock.insert(key, rid);
                }
            }
            1 => {
                // update: an index has no in-place update, so this is
                // delete-then-reinsert under a fresh Rid.
                if mock.contains_key(&key) {
                    ix.delete_entry(&tx, &key).unwrap();
                    let rid = Rid::new(round as i32, 1);
                    ix.insert_entry(&tx, &key, rid).unwrap();
                    mock.insert(key, rid);
                } else {
                    assert!(matches!(
                        ix.delete_entry(&tx, &key),
                        Err(StorageError::IndexEntryNotFound)
                    ));
                }
            }
            _ => {
                // delete
                let result = ix.delete_entry(&tx, &key);
                if mock.remove(&key).is_some() {
                    result.unwrap();
                } else {
                    assert!(matches!(result, Err(StorageError::IndexEntryNotFound)));
                }
            }
        }

        if round % 200 == 199 {
            ix.commit(&tx).unwrap();
            pool.flush_all_pages(ix.fd()).unwrap();
            let disk2 = Arc::new(DiskManager::new());
            let pool2 = Arc::new(BufferPool::with_capacity(disk2.clone(), 32));
            ix = BPlusTreeIndex::open(&path, disk2, pool2).unwrap();
            tx = Transaction::new();
        }
    }
    ix.commit(&tx).unwrap();

    for (k, rid) in &mock {
        assert_eq!(ix.get_value(k).unwrap(), Some(*rid));
    }
    let scanned: Vec<(Vec<u8>, Rid)> = ix.scan(None).unwrap().map(|r| r.unwrap()).collect();
    let expected: Vec<(Vec<u8>, Rid)> = mock.into_iter().collect();
    assert_eq!(scanned, expected);
}
