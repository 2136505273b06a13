//! Device-scope usage: bucket-state histogram and sector totals.
//!
//! Only buckets in `[first_bucket, nbuckets)` are counted; the prefix below
//! `first_bucket` is outside the device's capacity.

use crate::shard::Accumulator;
use bkt_types::{BucketMark, DATA_TYPE_NR, DataType, DeviceGeometry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

const UNAVAILABLE: usize = 0;
const EC: usize = 1;
const ALLOC: usize = 2;
const BUCKETS: usize = 3;
const SECTORS: usize = BUCKETS + DATA_TYPE_NR;
const FRAGMENTED: usize = SECTORS + DATA_TYPE_NR;
const WIDTH: usize = FRAGMENTED + DATA_TYPE_NR;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevTypeUsage {
    pub buckets: u64,
    pub sectors: u64,
    pub fragmented: u64,
}

/// Point-in-time device usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevUsage {
    pub nbuckets: u64,
    pub first_bucket: u64,
    pub bucket_size: u32,
    pub buckets_unavailable: u64,
    pub buckets_ec: u64,
    pub buckets_alloc: u64,
    pub by_type: [DevTypeUsage; DATA_TYPE_NR],
}

impl DevUsage {
    #[must_use]
    pub fn total_buckets(&self) -> u64 {
        self.nbuckets.saturating_sub(self.first_bucket)
    }

    #[must_use]
    pub fn data_type(&self, data_type: DataType) -> DevTypeUsage {
        self.by_type[data_type.index()]
    }

    /// `total − unavailable`. An unavailable count above the total should be
    /// impossible; it is logged and clamped.
    #[must_use]
    pub fn buckets_available(&self) -> u64 {
        let total = self.total_buckets();
        if self.buckets_unavailable > total {
            warn!(
                target: "bkt::usage",
                unavailable = self.buckets_unavailable,
                total,
                "buckets_unavailable_overflow"
            );
            return 0;
        }
        total - self.buckets_unavailable
    }

    /// Available buckets not already queued for allocation or open, clamped
    /// at zero.
    #[must_use]
    pub fn buckets_reclaimable(&self, queued: u64, open: u64) -> u64 {
        let available = self.buckets_available();
        let held = queued.saturating_add(open);
        if held > available {
            warn!(
                target: "bkt::usage",
                available,
                queued,
                open,
                "buckets_reclaimable_underflow"
            );
            return 0;
        }
        available - held
    }

    /// Sectors holding data of any type.
    #[must_use]
    pub fn sectors_used(&self) -> u64 {
        self.by_type.iter().map(|t| t.sectors).sum()
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.total_buckets().saturating_mul(u64::from(self.bucket_size))
    }
}

/// Signed change to a device's usage, derived from one mark transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevUsageDelta {
    counters: [i64; WIDTH],
}

impl Default for DevUsageDelta {
    fn default() -> Self {
        Self {
            counters: [0; WIDTH],
        }
    }
}

fn fragmented(mark: BucketMark, bucket_size: u32) -> i64 {
    let used = mark.total_sectors();
    if used == 0 || used >= u64::from(bucket_size) {
        0
    } else {
        i64::from(bucket_size - u32::try_from(used).unwrap_or(bucket_size))
    }
}

impl DevUsageDelta {
    /// Usage change for a bucket whose mark moved from `old` to `new`.
    #[must_use]
    pub fn from_marks(old: BucketMark, new: BucketMark, bucket_size: u32) -> Self {
        let mut delta = Self::default();
        delta.account(old, bucket_size, -1);
        delta.account(new, bucket_size, 1);
        delta
    }

    /// Contribution of a single bucket in state `mark`.
    #[must_use]
    pub fn of_bucket(mark: BucketMark, bucket_size: u32) -> Self {
        let mut delta = Self::default();
        delta.account(mark, bucket_size, 1);
        delta
    }

    fn account(&mut self, mark: BucketMark, bucket_size: u32, sign: i64) {
        let c = &mut self.counters;
        c[UNAVAILABLE] += sign * i64::from(mark.is_unavailable());
        c[EC] += sign * i64::from(mark.stripe());
        c[ALLOC] += sign * i64::from(mark.owned_by_allocator());
        let bucket_type = mark.bucket_type();
        c[BUCKETS + bucket_type.index()] += sign;
        c[SECTORS + mark.data_type().index()] += sign * i64::from(mark.dirty_sectors());
        c[SECTORS + DataType::Cached.index()] += sign * i64::from(mark.cached_sectors());
        c[FRAGMENTED + bucket_type.index()] += sign * fragmented(mark, bucket_size);
    }

    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.counters.iter_mut().zip(other.counters) {
            *a += b;
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.counters.iter().all(|&c| c == 0)
    }

    #[must_use]
    pub fn buckets_unavailable(&self) -> i64 {
        self.counters[UNAVAILABLE]
    }

    #[must_use]
    pub fn buckets(&self, data_type: DataType) -> i64 {
        self.counters[BUCKETS + data_type.index()]
    }

    #[must_use]
    pub fn sectors(&self, data_type: DataType) -> i64 {
        self.counters[SECTORS + data_type.index()]
    }
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[derive(Debug)]
pub struct DeviceUsageAccumulator {
    geometry: RwLock<DeviceGeometry>,
    counters: Accumulator,
}

impl DeviceUsageAccumulator {
    /// Accumulator for a device whose usable buckets are all free.
    #[must_use]
    pub fn new(shard_count: usize, geometry: DeviceGeometry) -> Self {
        let mut base = vec![0; WIDTH];
        base[BUCKETS + DataType::None.index()] = i64::try_from(geometry.usable_buckets()).unwrap_or(i64::MAX);
        Self {
            geometry: RwLock::new(geometry),
            counters: Accumulator::with_base(shard_count, base),
        }
    }

    /// Lock-free add; never blocks, never fails.
    pub fn add(&self, delta: &DevUsageDelta) {
        self.counters.add_dense(&delta.counters);
    }

    pub fn fold(&self) {
        self.counters.fold();
    }

    /// Base plus shards. Counters that transiently read negative while a
    /// transition is half-applied on another shard are clamped at zero.
    #[must_use]
    pub fn read(&self) -> DevUsage {
        let geometry = *self.geometry.read();
        Self::decode(geometry, &self.counters.read())
    }

    fn decode(geometry: DeviceGeometry, raw: &[i64]) -> DevUsage {
        let get = |i: usize| to_u64(raw.get(i).copied().unwrap_or(0));
        let mut by_type = [DevTypeUsage::default(); DATA_TYPE_NR];
        for (i, t) in by_type.iter_mut().enumerate() {
            *t = DevTypeUsage {
                buckets: get(BUCKETS + i),
                sectors: get(SECTORS + i),
                fragmented: get(FRAGMENTED + i),
            };
        }
        DevUsage {
            nbuckets: geometry.nbuckets,
            first_bucket: geometry.first_bucket,
            bucket_size: geometry.bucket_size,
            buckets_unavailable: get(UNAVAILABLE),
            buckets_ec: get(EC),
            buckets_alloc: get(ALLOC),
            by_type,
        }
    }

    /// Recount from a full set of marks (usable range only) and replace the
    /// accumulated state. Used after gc publishes and after a resize.
    pub fn rebuild(&self, geometry: DeviceGeometry, marks: impl IntoIterator<Item = BucketMark>) -> DevUsage {
        let mut total = DevUsageDelta::default();
        for mark in marks {
            total.account(mark, geometry.bucket_size, 1);
        }
        *self.geometry.write() = geometry;
        self.counters.replace(&total.counters);
        Self::decode(geometry, &total.counters)
    }
}
