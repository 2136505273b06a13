use bkt_buckets::MarkView;
use bkt_core::{DeviceState, FsSpace, KeyStore, MemKeyStore, SpaceConfig};
use bkt_error::SpaceError;
use bkt_mark::{MarkMode, Transaction, apply_at_commit, mark_key, run_transaction};
use bkt_types::{
    BucketIdx, DataType, DeviceIdx, ExtentPtr, Generation, Key, KeyPos, KeyValue, MemberInfo, ReplicasEntry,
};
use bkt_usage::ReserveMode;
use std::sync::{Arc, Barrier};
use std::thread;

const BUCKET_SIZE: u32 = 16;

fn space(devices: u32) -> FsSpace {
    let config = SpaceConfig {
        shard_count: 4,
        max_transaction_restarts: 10_000,
        ..SpaceConfig::default()
    };
    let fs = FsSpace::new(config).expect("space");
    for d in 0..devices {
        fs.add_device(DeviceIdx(d), MemberInfo::bare(BUCKET_SIZE, 100, 1), DeviceState::ReadWrite)
            .expect("add device");
    }
    fs
}

fn ptr(dev: u32, bucket: u64, generation: u8) -> ExtentPtr {
    ExtentPtr {
        dev: DeviceIdx(dev),
        offset: bucket * u64::from(BUCKET_SIZE),
        generation: Generation(generation),
        cached: false,
    }
}

fn cached_ptr(dev: u32, bucket: u64) -> ExtentPtr {
    ExtentPtr {
        cached: true,
        ..ptr(dev, bucket, 0)
    }
}

fn mark_of(fs: &FsSpace, dev: u32, bucket: u64) -> bkt_types::BucketMark {
    fs.device(DeviceIdx(dev))
        .expect("device")
        .buckets()
        .read_mark(BucketIdx(bucket), MarkView::Live)
        .expect("mark")
}

#[test]
fn deleting_a_btree_node_frees_its_bucket() {
    let fs = space(1);
    let store = MemKeyStore::new();
    let pos = KeyPos::new(0, 1);
    let node = Key::btree_ptr(pos, 8, vec![ptr(0, 7, 0)]);

    run_transaction(&fs, &store, |tx| {
        tx.reserve(8, 1, ReserveMode::Normal)?;
        tx.insert(node.clone())
    })
    .expect("insert");
    assert_eq!(fs.fs_usage().btree, 8);
    assert_eq!(mark_of(&fs, 0, 7).data_type(), DataType::Btree);
    assert_eq!(fs.fs_usage().online_reserved, 0);

    let removed = run_transaction(&fs, &store, |tx| tx.delete(pos)).expect("delete");
    assert_eq!(removed.value, Some(node));
    assert_eq!(fs.fs_usage().btree, 0);
    let mark = mark_of(&fs, 0, 7);
    assert!(mark.is_available());
    assert_eq!(mark.data_type(), DataType::None);

    fs.refill_freelists(DeviceIdx(0)).expect("refill");
    let device = fs.device(DeviceIdx(0)).expect("device");
    assert_eq!(device.buckets().bucket_gen(BucketIdx(7)).expect("gen"), Generation(1));
    assert!(device.buckets().is_stale(BucketIdx(7), Generation(0)).expect("stale"));
}

#[test]
fn concurrent_commits_to_one_replicas_entry_add_up() {
    const THREADS: u64 = 4;
    let fs = Arc::new(space(1));
    let store = Arc::new(MemKeyStore::new());
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let fs = Arc::clone(&fs);
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let key = Key::extent(KeyPos::new(10 + t, 0), 10, vec![ptr(0, 20 + t, 0)]);
                barrier.wait();
                run_transaction(&*fs, &*store, |tx| tx.insert(key.clone())).expect("commit");
            })
        })
        .collect();
    for h in handles {
        h.join().expect("writer");
    }

    let usage = fs.fs_usage();
    let entry = ReplicasEntry::single(DataType::User, DeviceIdx(0));
    assert_eq!(usage.replicas_sectors(&entry), 40);
    assert_eq!(usage.data, 40);
    assert_eq!(fs.dev_usage(DeviceIdx(0)).expect("usage").data_type(DataType::User).sectors, 40);
}

#[test]
fn contended_overwrites_lose_no_update() {
    const THREADS: usize = 4;
    const ROUNDS: u32 = 25;
    let fs = Arc::new(space(1));
    let store = Arc::new(MemKeyStore::new());
    let pos = KeyPos::new(1, 0);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut restarts = 0;
                for _ in 0..ROUNDS {
                    let done = run_transaction(&*fs, &*store, |tx| {
                        let size = tx.get(pos).map_or(0, |k| k.size);
                        tx.insert(Key {
                            pos,
                            size: size + 1,
                            value: KeyValue::Reservation { nr_replicas: 1 },
                        })
                    })
                    .expect("commit");
                    restarts += done.restarts;
                }
                restarts
            })
        })
        .collect();
    for h in handles {
        h.join().expect("writer");
    }

    let total = u32::try_from(THREADS).expect("small") * ROUNDS;
    assert_eq!(store.get(pos).key.map(|k| k.size), Some(total));
    let usage = fs.fs_usage();
    assert_eq!(usage.reserved, u64::from(total));
    assert_eq!(usage.persistent_reserved[0], u64::from(total));
}

#[test]
fn recomputed_deltas_apply_once() {
    let key = Key::extent(KeyPos::new(3, 0), 8, vec![ptr(0, 4, 0), ptr(1, 4, 0)]);

    let once = space(2);
    {
        let list = mark_key(&once, None, Some(&key), MarkMode::Commit).expect("stage");
        once.ensure_replicas(list.usage());
        let marks = once.locks().read_marks();
        apply_at_commit(&once, &[list], None, &marks, || Ok(())).expect("apply");
    }

    let twice = space(2);
    {
        let discarded = mark_key(&twice, None, Some(&key), MarkMode::Commit).expect("stage");
        drop(discarded);
        let list = mark_key(&twice, None, Some(&key), MarkMode::Commit).expect("restage");
        twice.ensure_replicas(list.usage());
        let marks = twice.locks().read_marks();
        apply_at_commit(&twice, &[list], None, &marks, || Ok(())).expect("apply");
    }

    assert_eq!(once.fs_usage(), twice.fs_usage());
    assert_eq!(once.fs_usage().data, 16);
    let entry = ReplicasEntry::new(DataType::User, 1, vec![DeviceIdx(1), DeviceIdx(0)]);
    assert_eq!(once.fs_usage().replicas_sectors(&entry), 16);
    assert_eq!(mark_of(&twice, 1, 4).dirty_sectors(), 8);
}

#[test]
fn overwrite_moves_sectors_between_buckets() {
    let fs = space(2);
    let store = MemKeyStore::new();
    let pos = KeyPos::new(5, 0);
    run_transaction(&fs, &store, |tx| {
        tx.insert(Key::extent(pos, 8, vec![ptr(0, 10, 0), cached_ptr(1, 11)]))
    })
    .expect("insert");
    assert_eq!(fs.fs_usage().cached, 8);
    assert_eq!(mark_of(&fs, 1, 11).cached_sectors(), 8);

    run_transaction(&fs, &store, |tx| tx.insert(Key::extent(pos, 8, vec![ptr(0, 12, 0)])))
        .expect("overwrite");
    let usage = fs.fs_usage();
    assert_eq!(usage.data, 8);
    assert_eq!(usage.cached, 0);
    assert_eq!(mark_of(&fs, 0, 10).dirty_sectors(), 0);
    assert_eq!(mark_of(&fs, 0, 12).dirty_sectors(), 8);
    assert_eq!(mark_of(&fs, 1, 11).cached_sectors(), 0);
}

#[test]
fn stale_new_pointer_is_refused_without_side_effects() {
    let fs = space(1);
    let store = MemKeyStore::new();
    fs.invalidate(DeviceIdx(0), BucketIdx(9)).expect("invalidate");

    let err = run_transaction(&fs, &store, |tx| {
        tx.insert(Key::extent(KeyPos::new(1, 0), 8, vec![ptr(0, 9, 0)]))
    })
    .expect_err("stale pointer");
    assert!(matches!(
        err,
        SpaceError::StaleReference {
            bucket: 9,
            ptr_gen: 0,
            bucket_gen: 1,
            ..
        }
    ));
    assert!(!err.is_fatal());
    assert!(store.is_empty());
    assert_eq!(fs.fs_usage().data, 0);
}

#[test]
fn invalidation_between_staging_and_commit_conflicts() {
    let fs = space(1);
    let store = MemKeyStore::new();
    let mut tx = Transaction::new(&fs, &store);
    tx.insert(Key::extent(KeyPos::new(2, 0), 8, vec![ptr(0, 30, 0)]))
        .expect("stage");
    fs.invalidate(DeviceIdx(0), BucketIdx(30)).expect("invalidate");

    let err = tx.commit().expect_err("bucket moved on");
    assert!(err.is_retryable());
    assert!(store.is_empty());
    assert_eq!(mark_of(&fs, 0, 30).dirty_sectors(), 0);
}

#[test]
fn reservation_is_consumed_then_released() {
    let fs = space(1);
    let store = MemKeyStore::new();

    let r = fs.reserve(64, 2, ReserveMode::Normal).expect("reserve");
    assert_eq!(fs.fs_usage().online_reserved, 128);
    r.release();
    assert_eq!(fs.fs_usage().online_reserved, 0);

    run_transaction(&fs, &store, |tx| {
        tx.reserve(16, 1, ReserveMode::Normal)?;
        tx.insert(Key::extent(KeyPos::new(4, 0), 8, vec![ptr(0, 40, 0)]))
    })
    .expect("commit");
    assert_eq!(fs.fs_usage().online_reserved, 0);
    assert_eq!(fs.fs_usage().data, 8);

    // An aborted attempt releases on drop.
    let err = run_transaction(&fs, &store, |tx| {
        tx.reserve(16, 1, ReserveMode::Normal)?;
        Err::<(), _>(SpaceError::InvalidGeometry("caller gave up".to_owned()))
    })
    .expect_err("body failed");
    assert!(matches!(err, SpaceError::InvalidGeometry(_)));
    assert_eq!(fs.fs_usage().online_reserved, 0);
}

#[test]
fn inode_keys_count_inodes() {
    let fs = space(1);
    let store = MemKeyStore::new();
    for n in 0..3 {
        let key = Key {
            pos: KeyPos::new(n, 0),
            size: 0,
            value: KeyValue::Inode,
        };
        run_transaction(&fs, &store, |tx| tx.insert(key.clone())).expect("inode");
    }
    run_transaction(&fs, &store, |tx| tx.delete(KeyPos::new(1, 0))).expect("unlink");
    assert_eq!(fs.fs_usage().nr_inodes, 2);
}

#[test]
fn corruption_latches_read_only() {
    let fs = space(1);
    let store = MemKeyStore::new();
    // Two keys claiming more sectors than the bucket holds.
    run_transaction(&fs, &store, |tx| {
        tx.insert(Key::extent(KeyPos::new(1, 0), 12, vec![ptr(0, 50, 0)]))
    })
    .expect("first");
    let err = run_transaction(&fs, &store, |tx| {
        tx.insert(Key::extent(KeyPos::new(2, 0), 12, vec![ptr(0, 50, 0)]))
    })
    .expect_err("overflow");
    assert!(err.is_fatal());
    assert!(fs.is_read_only());
    assert_eq!(mark_of(&fs, 0, 50).dirty_sectors(), 12);
    assert!(matches!(
        run_transaction(&fs, &store, |tx| tx.delete(KeyPos::new(1, 0))),
        Err(SpaceError::ReadOnly)
    ));
}

#[test]
fn pointers_into_dropped_buckets_are_stale_after_shrink() {
    let fs = space(2);
    let store = MemKeyStore::new();
    let pos = KeyPos::new(9, 0);
    run_transaction(&fs, &store, |tx| {
        tx.insert(Key::extent(pos, 8, vec![ptr(0, 10, 0), cached_ptr(1, 90)]))
    })
    .expect("insert");
    assert_eq!(fs.evacuate_cached(DeviceIdx(1)).expect("evacuate"), 1);
    fs.resize_device(DeviceIdx(1), 50).expect("shrink");

    let removed = run_transaction(&fs, &store, |tx| tx.delete(pos)).expect("delete");
    assert!(removed.value.is_some());
    let usage = fs.fs_usage();
    assert_eq!(usage.data, 0);
    assert_eq!(usage.cached, 0);
    assert_eq!(mark_of(&fs, 0, 10).dirty_sectors(), 0);
    assert!(!fs.is_read_only());

    // A new dirty pointer past the end is still refused.
    let err = run_transaction(&fs, &store, |tx| {
        tx.insert(Key::extent(KeyPos::new(10, 0), 8, vec![ptr(1, 90, 0)]))
    })
    .expect_err("dropped bucket");
    assert!(matches!(
        err,
        SpaceError::BucketOutOfRange {
            dev: 1,
            bucket: 90,
            nbuckets: 50
        }
    ));
    assert_eq!(fs.fs_usage().data, 0);
}
