//! Benchmark: mark CAS on one hot bucket vs spread across a device.

use bkt_buckets::{DeviceBuckets, MarkLocks, MarkView};
use bkt_types::{BucketIdx, DataType, DeviceGeometry, DeviceIdx};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn device(locks: &MarkLocks) -> DeviceBuckets {
    DeviceBuckets::new(
        locks,
        DeviceIdx(0),
        DeviceGeometry {
            bucket_size: 1 << 20,
            nbuckets: 4096,
            first_bucket: 1,
        },
    )
    .expect("valid geometry")
}

fn bench_cas_mark(c: &mut Criterion) {
    let locks = MarkLocks::new();
    let dev = device(&locks);
    let mut group = c.benchmark_group("cas_mark");

    group.bench_function("hot_bucket", |b| {
        b.iter(|| {
            dev.cas_mark(black_box(BucketIdx(7)), MarkView::Live, |m| {
                let sectors = (m.cached_sectors() + 1) & 0xffff;
                Ok(m.with_data_type(DataType::Cached).with_cached_sectors(sectors))
            })
            .expect("cas")
        });
    });

    let mut next = 1_u64;
    group.bench_function("spread", |b| {
        b.iter(|| {
            next = next % 4095 + 1;
            dev.cas_mark(black_box(BucketIdx(next)), MarkView::Live, |m| {
                Ok(m.with_owned_by_allocator(!m.owned_by_allocator()))
            })
            .expect("cas")
        });
    });

    group.bench_function("read_mark", |b| {
        b.iter(|| dev.read_mark(black_box(BucketIdx(7)), MarkView::Live).expect("read"));
    });

    group.bench_function("is_stale", |b| {
        b.iter(|| {
            dev.is_stale(black_box(BucketIdx(7)), bkt_types::Generation(0))
                .expect("gen")
        });
    });

    group.finish();
}

criterion_group!(benches, bench_cas_mark);
criterion_main!(benches);
