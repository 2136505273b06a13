//! Choosing which available buckets to invalidate.

use bkt_types::{BUCKET_GC_GEN_MAX, BucketIdx, BucketMark};

/// An available bucket that could be invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimCandidate {
    pub bucket: BucketIdx,
    /// Cached sectors lost by invalidating it.
    pub cached_sectors: u32,
    /// `gen - oldest_gen`: how far behind the oldest pointer into it is.
    pub gc_gen: u8,
}

impl ReclaimCandidate {
    /// `None` when the bucket cannot be invalidated at all: it holds dirty
    /// data, belongs to a stripe, is owned by the allocator, or another
    /// generation bump would outrun the oldest pointer gc knows about.
    #[must_use]
    pub fn from_mark(bucket: BucketIdx, mark: BucketMark, gc_gen: u8) -> Option<Self> {
        if !mark.is_available() || mark.owned_by_allocator() || mark.data_type().is_fixed_metadata() {
            return None;
        }
        if gc_gen >= BUCKET_GC_GEN_MAX {
            return None;
        }
        Some(Self {
            bucket,
            cached_sectors: mark.cached_sectors(),
            gc_gen,
        })
    }
}

/// Up to `limit` candidates, cheapest first: empty buckets before ones
/// holding cached data, then lowest `gc_gen`, then lowest index.
#[must_use]
pub fn select_reclaim_candidates(
    candidates: impl IntoIterator<Item = ReclaimCandidate>,
    limit: usize,
) -> Vec<ReclaimCandidate> {
    let mut all: Vec<ReclaimCandidate> = candidates.into_iter().collect();
    all.sort_unstable_by_key(|c| (c.cached_sectors, c.gc_gen, c.bucket));
    all.truncate(limit);
    all
}
