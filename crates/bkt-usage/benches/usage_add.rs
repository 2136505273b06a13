//! Benchmark: sharded usage adds, consistent reads, and reservation churn.

use bkt_buckets::MarkLocks;
use bkt_types::{BucketMark, DataType, DeviceGeometry, DeviceIdx, ReplicasEntry};
use bkt_usage::{
    DevUsageDelta, DeviceUsageAccumulator, FsUsageAccumulator, FsUsageDelta, ReservationPool,
    ReserveMode,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

fn bench_usage(c: &mut Criterion) {
    let locks = MarkLocks::new();
    let fs = Arc::new(FsUsageAccumulator::new(8));
    let entries: Vec<ReplicasEntry> = (0..32)
        .map(|d| ReplicasEntry::single(DataType::User, DeviceIdx(d)))
        .collect();
    fs.ensure_entries(&entries, &locks.write_marks());

    let mut delta = FsUsageDelta::new();
    delta.add_replicas(&entries[7], 8);

    let mut group = c.benchmark_group("usage");

    group.bench_function("fs_add", |b| {
        b.iter(|| {
            let guard = locks.read_marks();
            fs.add(black_box(&delta), &guard).expect("known entry");
        });
    });

    group.bench_function("fs_read_consistent", |b| {
        b.iter(|| black_box(fs.read_consistent()));
    });

    let dev = DeviceUsageAccumulator::new(
        8,
        DeviceGeometry {
            bucket_size: 1024,
            nbuckets: 1 << 16,
            first_bucket: 1,
        },
    );
    let old = BucketMark::EMPTY;
    let new = old.with_data_type(DataType::Btree).with_dirty_sectors(512);
    let dev_delta = DevUsageDelta::from_marks(old, new, 1024);
    group.bench_function("dev_add", |b| {
        b.iter(|| dev.add(black_box(&dev_delta)));
    });

    let pool = Arc::new(ReservationPool::new(Arc::clone(&fs), 6));
    pool.set_capacity(1 << 40);
    group.bench_function("reserve_release", |b| {
        b.iter(|| {
            pool.acquire(black_box(8), 2, ReserveMode::Normal)
                .expect("capacity")
                .release();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_usage);
criterion_main!(benches);
