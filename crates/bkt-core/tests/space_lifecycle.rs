use bkt_alloc::Reserve;
use bkt_buckets::MarkView;
use bkt_core::{DeviceState, FsSpace, SpaceConfig, WriteOutcome};
use bkt_error::SpaceError;
use bkt_types::{BucketIdx, DataType, DeviceIdx, Generation, MemberInfo, ReplicasEntry};
use bkt_usage::{FsUsageDelta, ReserveMode};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

const DEV: DeviceIdx = DeviceIdx(0);

/// Put `sectors` of cached data in an otherwise empty bucket, accounted in
/// both device and filesystem usage.
fn cache_bucket(fs: &FsSpace, bucket: u64, sectors: u32) {
    let device = fs.device(DEV).expect("device");
    let mut delta = FsUsageDelta::new();
    delta.add_replicas(&ReplicasEntry::single(DataType::Cached, DEV), i64::from(sectors));
    fs.ensure_replicas(&delta);
    let marks = fs.locks().read_marks();
    device
        .update_mark(BucketIdx(bucket), MarkView::Live, &marks, |m| {
            Ok(m.with_cached_sectors(sectors))
        })
        .expect("cache");
    fs.usage().add(&delta, &marks).expect("fs usage");
}

fn space_with_device(nbuckets: u64) -> FsSpace {
    let config = SpaceConfig {
        shard_count: 4,
        ..SpaceConfig::default()
    };
    let fs = FsSpace::new(config).expect("space");
    fs.add_device(DEV, MemberInfo::bare(8, nbuckets, 0), DeviceState::ReadWrite)
        .expect("add device");
    fs
}

#[test]
fn reservation_admission_on_empty_device() {
    let fs = space_with_device(100);
    assert_eq!(fs.capacity(), 800);

    let r = fs.reserve(400, 1, ReserveMode::Normal).expect("half the device");
    assert_eq!(r.sectors(), 400);
    assert_eq!(fs.fs_usage().online_reserved, 400);

    let err = fs
        .reserve(100_000, 1, ReserveMode::Normal)
        .expect_err("far beyond capacity");
    assert!(matches!(err, SpaceError::InsufficientSpace { .. }));

    drop(r);
    assert_eq!(fs.fs_usage().online_reserved, 0);
}

#[test]
fn invalidation_makes_old_pointers_stale() {
    let fs = space_with_device(100);
    let loaded = fs
        .load_alloc_info(DEV, [(BucketIdx(5), Generation(3), Generation(3))])
        .expect("load");
    assert_eq!(loaded, 1);

    let device = fs.device(DEV).expect("device");
    assert!(!device.buckets().is_stale(BucketIdx(5), Generation(3)).expect("check"));

    let generation = fs.invalidate(DEV, BucketIdx(5)).expect("invalidate");
    assert_eq!(generation, Generation(4));
    assert!(device.buckets().is_stale(BucketIdx(5), Generation(3)).expect("check"));
    assert!(!device.buckets().is_stale(BucketIdx(5), Generation(4)).expect("check"));
    assert!(matches!(
        device.buckets().check_ptr(BucketIdx(5), Generation(3)),
        Err(SpaceError::StaleReference {
            ptr_gen: 3,
            bucket_gen: 4,
            ..
        })
    ));

    // Already staged: a second invalidation is refused.
    assert!(matches!(
        fs.invalidate(DEV, BucketIdx(5)),
        Err(SpaceError::DeviceBusy { .. })
    ));
}

#[test]
fn refill_allocate_release_cycle() {
    let fs = space_with_device(100);
    let staged = fs.refill_freelists(DEV).expect("refill");
    assert_eq!(staged, fs.config().freelist.incoming);
    assert_eq!(fs.dev_usage(DEV).expect("usage").buckets_alloc, staged as u64);

    let moved = fs.promote_incoming(DEV).expect("promote");
    assert_eq!(moved.len(), staged);
    let stats = fs.freelist_stats(DEV).expect("stats");
    assert_eq!(stats.incoming, 0);
    assert_eq!(stats.tiers[Reserve::BtreeMovingGc.index()], 8);

    let open = fs.allocate(DEV, Reserve::None).expect("allocate");
    assert_eq!(open.tier, Reserve::None);
    assert_eq!(fs.freelist_stats(DEV).expect("stats").open, 1);

    // Aborted writes put the bucket back where it came from.
    fs.release_bucket(DEV, open.bucket, WriteOutcome::Aborted).expect("abort");
    let again = fs.allocate(DEV, Reserve::None).expect("allocate again");
    assert_eq!(again.bucket, open.bucket);

    fs.release_bucket(DEV, again.bucket, WriteOutcome::Written).expect("written");
    let mark = fs
        .device(DEV)
        .expect("device")
        .buckets()
        .read_mark(again.bucket, MarkView::Live)
        .expect("mark");
    assert!(!mark.owned_by_allocator());

    assert!(matches!(
        fs.release_bucket(DEV, again.bucket, WriteOutcome::Written),
        Err(SpaceError::CorruptUsageState(_))
    ));

    // Queued and open buckets never count as reclaimable.
    let usage = fs.dev_usage(DEV).expect("usage");
    let stats = fs.freelist_stats(DEV).expect("stats");
    let reclaimable = fs.reclaimable_buckets(DEV).expect("reclaimable");
    assert_eq!(
        reclaimable,
        usage.buckets_available() - (stats.queued() + stats.open) as u64
    );
}

#[test]
fn refill_reclaims_cached_buckets() {
    let fs = space_with_device(20);
    let device = fs.device(DEV).expect("device");
    cache_bucket(&fs, 2, 4);
    assert_eq!(fs.fs_usage().cached, 4);
    let config = fs.config().freelist;
    let staged = fs.refill_freelists(DEV).expect("refill");
    assert_eq!(staged, 20_usize.min(config.incoming));
    let moved: BTreeSet<u64> = fs
        .promote_incoming(DEV)
        .expect("promote")
        .iter()
        .map(|o| o.bucket.0)
        .collect();
    assert_eq!(moved.len(), staged);
    assert_eq!(device.buckets().bucket_gen(BucketIdx(2)).expect("gen"), Generation(1));
    assert_eq!(fs.fs_usage().cached, 0);
}

#[test]
fn device_lifecycle() {
    let fs = space_with_device(50);
    let mut member = MemberInfo::bare(8, 40, 2);
    member.superblock_offsets = vec![0];
    member.superblock_sectors = 8;
    member.journal_buckets = vec![3];
    fs.add_device(DeviceIdx(1), member, DeviceState::ReadWrite).expect("add");
    assert_eq!(fs.capacity(), 400 + 38 * 8);
    assert_eq!(fs.fs_usage().hidden, 16);

    fs.resize_device(DeviceIdx(1), 60).expect("grow");
    assert_eq!(fs.dev_usage(DeviceIdx(1)).expect("usage").nbuckets, 60);
    assert_eq!(fs.capacity(), 400 + 58 * 8);

    assert!(matches!(
        fs.resize_device(DeviceIdx(1), 2),
        Err(SpaceError::InvalidGeometry(_) | SpaceError::DeviceBusy { .. })
    ));

    let old = fs
        .set_device_state(DeviceIdx(1), DeviceState::ReadOnly)
        .expect("ro");
    assert_eq!(old, DeviceState::ReadWrite);
    assert_eq!(fs.capacity(), 400);
    assert!(matches!(
        fs.allocate(DeviceIdx(1), Reserve::None),
        Err(SpaceError::DeviceBusy { .. })
    ));

    fs.remove_device(DeviceIdx(1)).expect("remove");
    assert!(matches!(
        fs.device(DeviceIdx(1)),
        Err(SpaceError::DeviceNotFound { dev: 1 })
    ));
    assert_eq!(fs.fs_usage().hidden, 0);
    assert_eq!(fs.snapshot().devices.len(), 1);
}

#[test]
fn remove_refuses_devices_holding_data() {
    let fs = space_with_device(10);
    fs.refill_freelists(DEV).expect("refill");
    fs.promote_incoming(DEV).expect("promote");
    let open = fs.allocate(DEV, Reserve::BtreeMovingGc).expect("allocate");
    assert!(matches!(
        fs.remove_device(DEV),
        Err(SpaceError::DeviceBusy { .. })
    ));
    fs.release_bucket(DEV, open.bucket, WriteOutcome::Aborted).expect("abort");
    fs.remove_device(DEV).expect("remove");
    assert_eq!(fs.capacity(), 0);
}

#[test]
fn evacuate_drops_cached_buckets() {
    let fs = space_with_device(10);
    let device = fs.device(DEV).expect("device");
    fs.mark_metadata_bucket(DEV, BucketIdx(0), DataType::Journal, 8)
        .expect("journal");
    cache_bucket(&fs, 3, 2);
    cache_bucket(&fs, 4, 2);
    assert_eq!(fs.evacuate_cached(DEV).expect("evacuate"), 2);
    assert_eq!(fs.fs_usage().cached, 0);
    let usage = fs.dev_usage(DEV).expect("usage");
    assert_eq!(usage.data_type(DataType::Cached).sectors, 0);
    assert_eq!(usage.data_type(DataType::Journal).buckets, 1);
    assert_eq!(device.buckets().bucket_gen(BucketIdx(3)).expect("gen"), Generation(1));
    assert_eq!(device.buckets().bucket_gen(BucketIdx(0)).expect("gen"), Generation(0));
}

#[test]
fn snapshot_serializes() {
    let fs = space_with_device(10);
    let snap = fs.snapshot();
    let json = serde_json::to_string(&snap).expect("serialize");
    let back: bkt_core::SpaceSnapshot = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, snap);
    assert!(bkt_core::dev_usage_to_text(&snap.devices[0]).starts_with("device 0 (rw):"));
}

#[test]
fn concurrent_allocators_never_share_a_bucket() {
    const THREADS: usize = 4;
    let fs = Arc::new(space_with_device(200));
    fs.refill_freelists(DEV).expect("refill");
    fs.promote_incoming(DEV).expect("promote");

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut got = Vec::new();
                while let Ok(open) = fs.allocate(DEV, Reserve::BtreeMovingGc) {
                    got.push(open.bucket);
                    fs.release_bucket(DEV, open.bucket, WriteOutcome::Written)
                        .expect("release");
                }
                got
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().expect("allocator thread"));
    }
    let unique: BTreeSet<BucketIdx> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len());
    assert_eq!(all.len(), fs.config().freelist.incoming);
    assert_eq!(fs.dev_usage(DEV).expect("usage").buckets_alloc, 0);
}

#[test]
fn readded_device_index_starts_past_old_generations() {
    let fs = space_with_device(50);
    let member = MemberInfo::bare(8, 40, 2);
    fs.add_device(DeviceIdx(1), member.clone(), DeviceState::ReadWrite)
        .expect("add");
    assert_eq!(fs.invalidate(DeviceIdx(1), BucketIdx(5)).expect("invalidate"), Generation(1));
    fs.remove_device(DeviceIdx(1)).expect("remove");

    let device = fs
        .add_device(DeviceIdx(1), member, DeviceState::ReadWrite)
        .expect("re-add");
    let buckets = device.buckets();
    assert_eq!(buckets.bucket_gen(BucketIdx(5)).expect("gen"), Generation(2));
    assert_eq!(buckets.bucket_gen(BucketIdx(6)).expect("gen"), Generation(1));
    assert_eq!(buckets.gc_gen_distance(BucketIdx(5)).expect("distance"), 0);

    // Pointers written against the old device no longer resolve.
    assert!(buckets.is_stale(BucketIdx(5), Generation(1)).expect("stale"));
    assert!(buckets.is_stale(BucketIdx(6), Generation(0)).expect("stale"));
    assert!(!buckets.is_stale(BucketIdx(6), Generation(1)).expect("fresh"));

    // A fresh index still starts at zero.
    let other = fs
        .add_device(DeviceIdx(2), MemberInfo::bare(8, 40, 2), DeviceState::ReadWrite)
        .expect("add fresh");
    assert_eq!(other.buckets().bucket_gen(BucketIdx(5)).expect("gen"), Generation(0));
}
