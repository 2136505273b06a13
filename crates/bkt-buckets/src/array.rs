//! Fixed-length bucket arrays.
//!
//! A [`BucketArray`] is never resized in place: growing or shrinking a device
//! builds a new array and publishes it through the RCU slot, so an index that
//! was in range for a loaded array stays in range for as long as the caller
//! holds it.

use bkt_types::{BucketIdx, BucketMark, DeviceGeometry, Generation};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// One bucket: the packed mark word plus the gc-maintained oldest generation
/// still referenced by any pointer into it.
#[derive(Debug, Default)]
pub struct Bucket {
    pub(crate) mark: AtomicU64,
    pub(crate) oldest_gen: AtomicU8,
}

impl Bucket {
    fn with(mark: BucketMark, oldest_gen: Generation) -> Self {
        Self {
            mark: AtomicU64::new(mark.raw()),
            oldest_gen: AtomicU8::new(oldest_gen.0),
        }
    }

    #[inline]
    #[must_use]
    pub fn mark(&self) -> BucketMark {
        BucketMark::from_raw(self.mark.load(Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn oldest_gen(&self) -> Generation {
        Generation(self.oldest_gen.load(Ordering::Acquire))
    }

    pub(crate) fn store_mark(&self, mark: BucketMark) {
        self.mark.store(mark.raw(), Ordering::Release);
    }

    pub(crate) fn store_oldest_gen(&self, generation: Generation) {
        self.oldest_gen.store(generation.0, Ordering::Release);
    }
}

/// Mark array for one device, one entry per bucket in `[0, nbuckets)`.
///
/// Buckets below `first_bucket` exist so fixed metadata (the superblock at
/// sector 0) can be marked; they are never allocated or counted as capacity.
#[derive(Debug)]
pub struct BucketArray {
    geometry: DeviceGeometry,
    buckets: Box<[Bucket]>,
}

impl BucketArray {
    #[must_use]
    pub fn new(geometry: DeviceGeometry) -> Self {
        let buckets = (0..geometry.nbuckets).map(|_| Bucket::default()).collect();
        Self { geometry, buckets }
    }

    /// Gc-epoch copy of `live`: generations are carried so pointer staleness
    /// is judged the same way, everything else starts empty. `oldest_gen`
    /// starts at the bucket generation and is lowered by each pointer seen.
    #[must_use]
    pub fn gc_copy_of(live: &Self) -> Self {
        let buckets = live
            .buckets
            .iter()
            .map(|b| {
                let generation = b.mark().generation();
                Bucket::with(BucketMark::EMPTY.with_generation(generation), generation)
            })
            .collect();
        Self {
            geometry: live.geometry,
            buckets,
        }
    }

    /// Copy of `self` with a new bucket count. Entries past the old end start
    /// empty; entries past the new end are dropped.
    #[must_use]
    pub fn resized(&self, geometry: DeviceGeometry) -> Self {
        let buckets = (0..geometry.nbuckets)
            .map(|i| {
                usize::try_from(i)
                    .ok()
                    .and_then(|i| self.buckets.get(i))
                    .map_or_else(Bucket::default, |b| Bucket::with(b.mark(), b.oldest_gen()))
            })
            .collect();
        Self { geometry, buckets }
    }

    #[must_use]
    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.geometry.nbuckets
    }

    #[inline]
    #[must_use]
    pub fn get(&self, bucket: BucketIdx) -> Option<&Bucket> {
        usize::try_from(bucket.0)
            .ok()
            .and_then(|i| self.buckets.get(i))
    }

    /// `(index, bucket)` for every bucket, including those below
    /// `first_bucket`.
    pub fn iter(&self) -> impl Iterator<Item = (BucketIdx, &Bucket)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| (BucketIdx(i as u64), b))
    }

    /// `(index, bucket)` for the allocatable range `[first_bucket, nbuckets)`.
    pub fn iter_usable(&self) -> impl Iterator<Item = (BucketIdx, &Bucket)> {
        let first = self.geometry.first_bucket;
        self.iter().filter(move |(idx, _)| idx.0 >= first)
    }
}

/// The generation store: one byte per bucket, the ground truth for pointer
/// staleness. Updated on invalidation after the mark's generation moves.
#[derive(Debug)]
pub struct BucketGens {
    first_bucket: u64,
    gens: Box<[AtomicU8]>,
}

impl BucketGens {
    #[must_use]
    pub fn from_array(array: &BucketArray) -> Self {
        Self {
            first_bucket: array.geometry.first_bucket,
            gens: array
                .buckets
                .iter()
                .map(|b| AtomicU8::new(b.mark().generation().0))
                .collect(),
        }
    }

    #[must_use]
    pub fn first_bucket(&self) -> u64 {
        self.first_bucket
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.gens.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gens.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn get(&self, bucket: BucketIdx) -> Option<Generation> {
        usize::try_from(bucket.0)
            .ok()
            .and_then(|i| self.gens.get(i))
            .map(|g| Generation(g.load(Ordering::Acquire)))
    }

    pub(crate) fn set(&self, bucket: BucketIdx, generation: Generation) -> bool {
        match usize::try_from(bucket.0).ok().and_then(|i| self.gens.get(i)) {
            Some(slot) => {
                slot.store(generation.0, Ordering::Release);
                true
            }
            None => false,
        }
    }
}
