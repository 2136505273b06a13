#![forbid(unsafe_code)]
//! Bucket freelists and open buckets.
//!
//! ## Design
//!
//! The allocator state of one device is layered:
//!
//! 1. **Incoming**: buckets just invalidated, waiting out the window in which
//!    readers may still hold pointers at the old generation.
//! 2. **Reserve tiers**: [`Reserve::BtreeMovingGc`], [`Reserve::MovingGc`]
//!    and [`Reserve::None`]; incoming buckets are promoted into the most
//!    privileged tier with room.
//! 3. **Open buckets**: popped from a tier and accepting writes, bounded by
//!    `max_open`.
//!
//! This crate holds only the queues. Callers keep them behind the single
//! filesystem-wide freelist lock and perform every mark update outside it.
//! [`select_reclaim_candidates`] picks which available buckets to
//! invalidate next.
//!
//! # Logging
//!
//! - **DEBUG** `bkt::alloc`: `bucket_open`, `bucket_close`, `bucket_returned`,
//!   `incoming_push`, `incoming_promote`

mod reclaim;

pub use reclaim::{ReclaimCandidate, select_reclaim_candidates};

use bkt_error::{Result, SpaceError};
use bkt_types::{BucketIdx, DeviceIdx};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Freelist tier, in increasing privilege.
///
/// A caller at a given reserve may draw from [`Reserve::None`] and from
/// every tier up to and including its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reserve {
    None,
    MovingGc,
    BtreeMovingGc,
}

impl Reserve {
    pub const ALL: [Self; 3] = [Self::None, Self::MovingGc, Self::BtreeMovingGc];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::MovingGc => "movinggc",
            Self::BtreeMovingGc => "btree_movinggc",
        }
    }
}

/// Tier capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreelistConfig {
    pub btree_reserve: usize,
    pub movinggc_reserve: usize,
    pub normal: usize,
    pub incoming: usize,
}

impl Default for FreelistConfig {
    /// Small privileged reserves, a deeper normal tier, and an incoming
    /// queue as deep as all tiers together.
    fn default() -> Self {
        Self {
            btree_reserve: 8,
            movinggc_reserve: 16,
            normal: 64,
            incoming: 88,
        }
    }
}

impl FreelistConfig {
    #[must_use]
    pub fn capacity(&self, tier: Reserve) -> usize {
        match tier {
            Reserve::None => self.normal,
            Reserve::MovingGc => self.movinggc_reserve,
            Reserve::BtreeMovingGc => self.btree_reserve,
        }
    }
}

/// An open bucket and the tier it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBucket {
    pub bucket: BucketIdx,
    pub tier: Reserve,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreelistStats {
    pub tiers: [usize; 3],
    pub incoming: usize,
    pub open: usize,
}

impl FreelistStats {
    /// Buckets sitting on any queue (not counting open ones).
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tiers.iter().sum::<usize>() + self.incoming
    }
}

#[derive(Debug)]
pub struct DeviceFreelists {
    dev: DeviceIdx,
    config: FreelistConfig,
    max_open: usize,
    tiers: [VecDeque<BucketIdx>; 3],
    incoming: VecDeque<BucketIdx>,
    open: BTreeMap<BucketIdx, Reserve>,
}

impl DeviceFreelists {
    #[must_use]
    pub fn new(dev: DeviceIdx, config: FreelistConfig, max_open: usize) -> Self {
        Self {
            dev,
            config,
            max_open,
            tiers: Default::default(),
            incoming: VecDeque::new(),
            open: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn dev(&self) -> DeviceIdx {
        self.dev
    }

    #[must_use]
    pub fn stats(&self) -> FreelistStats {
        FreelistStats {
            tiers: [self.tiers[0].len(), self.tiers[1].len(), self.tiers[2].len()],
            incoming: self.incoming.len(),
            open: self.open.len(),
        }
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.stats().queued()
    }

    #[must_use]
    pub fn open_len(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn is_open(&self, bucket: BucketIdx) -> bool {
        self.open.contains_key(&bucket)
    }

    /// Whether `bucket` is queued anywhere or open.
    #[must_use]
    pub fn holds(&self, bucket: BucketIdx) -> bool {
        self.is_open(bucket)
            || self.incoming.contains(&bucket)
            || self.tiers.iter().any(|t| t.contains(&bucket))
    }

    /// Pop a bucket for writing and mark it open.
    ///
    /// Tries [`Reserve::None`] first, then each more privileged tier up to
    /// `reserve`, so ordinary allocations leave the reserves alone.
    pub fn pop(&mut self, reserve: Reserve) -> Result<OpenBucket> {
        if self.open.len() >= self.max_open {
            return Err(SpaceError::OpenBucketsExhausted {
                dev: self.dev.0,
                limit: self.max_open,
            });
        }
        for tier in Reserve::ALL.into_iter().filter(|t| *t <= reserve) {
            if let Some(bucket) = self.tiers[tier.index()].pop_front() {
                self.open.insert(bucket, tier);
                debug!(
                    target: "bkt::alloc",
                    dev = self.dev.0,
                    bucket = bucket.0,
                    tier = tier.name(),
                    open = self.open.len(),
                    "bucket_open"
                );
                return Ok(OpenBucket { bucket, tier });
            }
        }
        Err(SpaceError::FreelistEmpty { dev: self.dev.0 })
    }

    /// Forget an open bucket. Returns the tier it came from.
    pub fn close(&mut self, bucket: BucketIdx) -> Option<Reserve> {
        let tier = self.open.remove(&bucket)?;
        debug!(target: "bkt::alloc", dev = self.dev.0, bucket = bucket.0, "bucket_close");
        Some(tier)
    }

    /// Close an open bucket whose write was abandoned and put it back at the
    /// head of its tier, generation untouched.
    pub fn return_open(&mut self, bucket: BucketIdx) -> Option<Reserve> {
        let tier = self.open.remove(&bucket)?;
        self.tiers[tier.index()].push_front(bucket);
        debug!(
            target: "bkt::alloc",
            dev = self.dev.0,
            bucket = bucket.0,
            tier = tier.name(),
            "bucket_returned"
        );
        Some(tier)
    }

    #[must_use]
    pub fn incoming_has_room(&self) -> bool {
        self.incoming.len() < self.config.incoming
    }

    /// Stage a freshly invalidated bucket.
    pub fn push_incoming(&mut self, bucket: BucketIdx) -> Result<()> {
        if !self.incoming_has_room() {
            return Err(SpaceError::DeviceBusy {
                dev: self.dev.0,
                detail: format!("incoming queue full ({})", self.config.incoming),
            });
        }
        self.incoming.push_back(bucket);
        debug!(
            target: "bkt::alloc",
            dev = self.dev.0,
            bucket = bucket.0,
            incoming = self.incoming.len(),
            "incoming_push"
        );
        Ok(())
    }

    /// Move staged buckets onto the tiers, most privileged first, each up to
    /// its capacity. Returns the buckets moved and where they went.
    pub fn promote_incoming(&mut self) -> Vec<OpenBucket> {
        let mut moved = Vec::new();
        for tier in Reserve::ALL.into_iter().rev() {
            let cap = self.config.capacity(tier);
            let queue = &mut self.tiers[tier.index()];
            while queue.len() < cap {
                let Some(bucket) = self.incoming.pop_front() else {
                    break;
                };
                queue.push_back(bucket);
                moved.push(OpenBucket { bucket, tier });
            }
        }
        if !moved.is_empty() {
            debug!(
                target: "bkt::alloc",
                dev = self.dev.0,
                moved = moved.len(),
                incoming = self.incoming.len(),
                "incoming_promote"
            );
        }
        moved
    }

    /// Lowest queued or open bucket at or past `nbuckets`, if any.
    #[must_use]
    pub fn first_held_at_or_beyond(&self, nbuckets: u64) -> Option<BucketIdx> {
        self.open
            .keys()
            .copied()
            .chain(self.incoming.iter().copied())
            .chain(self.tiers.iter().flatten().copied())
            .filter(|b| b.0 >= nbuckets)
            .min()
    }

    /// Empty every queue, returning what was queued. Open buckets stay.
    pub fn drain_queued(&mut self) -> Vec<BucketIdx> {
        let mut out: Vec<BucketIdx> = self.incoming.drain(..).collect();
        for tier in &mut self.tiers {
            out.extend(tier.drain(..));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn freelists(max_open: usize) -> DeviceFreelists {
        DeviceFreelists::new(
            DeviceIdx(0),
            FreelistConfig {
                btree_reserve: 1,
                movinggc_reserve: 2,
                normal: 3,
                incoming: 8,
            },
            max_open,
        )
    }

    fn stage(f: &mut DeviceFreelists, buckets: impl IntoIterator<Item = u64>) {
        for b in buckets {
            f.push_incoming(BucketIdx(b)).expect("room");
        }
        f.promote_incoming();
    }

    #[test]
    fn promotion_fills_privileged_tiers_first() {
        let mut f = freelists(8);
        stage(&mut f, 1..=4);
        let stats = f.stats();
        assert_eq!(stats.tiers, [1, 2, 1]);
        assert_eq!(stats.incoming, 0);

        stage(&mut f, 5..=8);
        assert_eq!(f.stats().tiers, [3, 2, 1]);
        assert_eq!(f.stats().incoming, 2);
        assert_eq!(f.queued_len(), 8);
    }

    #[test]
    fn ordinary_allocations_leave_reserves_alone() {
        let mut f = freelists(8);
        stage(&mut f, 1..=4);
        let first = f.pop(Reserve::None).expect("normal tier");
        assert_eq!(first, OpenBucket { bucket: BucketIdx(4), tier: Reserve::None });
        assert_eq!(
            f.pop(Reserve::None),
            Err(SpaceError::FreelistEmpty { dev: 0 })
        );
        let gc = f.pop(Reserve::MovingGc).expect("movinggc tier");
        assert_eq!(gc.tier, Reserve::MovingGc);
        let btree = f.pop(Reserve::BtreeMovingGc).expect("falls through");
        assert_eq!(btree.tier, Reserve::MovingGc);
        let last = f.pop(Reserve::BtreeMovingGc).expect("btree tier");
        assert_eq!(last.tier, Reserve::BtreeMovingGc);
        assert_eq!(f.open_len(), 4);
    }

    #[test]
    fn open_limit_is_enforced() {
        let mut f = freelists(1);
        stage(&mut f, 1..=4);
        f.pop(Reserve::BtreeMovingGc).expect("first");
        assert_eq!(
            f.pop(Reserve::BtreeMovingGc),
            Err(SpaceError::OpenBucketsExhausted { dev: 0, limit: 1 })
        );
    }

    #[test]
    fn aborted_bucket_returns_to_its_tier() {
        let mut f = freelists(8);
        stage(&mut f, 1..=4);
        let ob = f.pop(Reserve::None).expect("pop");
        assert_eq!(f.return_open(ob.bucket), Some(Reserve::None));
        assert!(!f.is_open(ob.bucket));
        assert_eq!(f.pop(Reserve::None).expect("again").bucket, ob.bucket);
        assert_eq!(f.close(ob.bucket), Some(Reserve::None));
        assert_eq!(f.close(ob.bucket), None);
    }

    #[test]
    fn incoming_is_bounded() {
        let mut f = freelists(8);
        for b in 0..8 {
            f.push_incoming(BucketIdx(b)).expect("room");
        }
        assert!(matches!(
            f.push_incoming(BucketIdx(9)),
            Err(SpaceError::DeviceBusy { .. })
        ));
    }

    #[test]
    fn held_beyond_and_drain() {
        let mut f = freelists(8);
        stage(&mut f, [3, 9, 12]);
        assert_eq!(f.pop(Reserve::MovingGc).expect("pop").bucket, BucketIdx(9));
        assert_eq!(f.first_held_at_or_beyond(10), Some(BucketIdx(12)));
        assert_eq!(f.first_held_at_or_beyond(13), None);
        assert!(f.holds(BucketIdx(9)));
        let mut drained = f.drain_queued();
        drained.sort();
        assert_eq!(drained.len(), 2);
        assert_eq!(f.queued_len(), 0);
        assert_eq!(f.open_len(), 1);
    }

    #[test]
    fn config_loads_partially() {
        let cfg: FreelistConfig = serde_json::from_str(r#"{"normal": 5}"#).expect("parse");
        assert_eq!(cfg.normal, 5);
        assert_eq!(cfg.btree_reserve, FreelistConfig::default().btree_reserve);
    }
}
