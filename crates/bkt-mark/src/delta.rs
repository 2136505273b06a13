//! Deltas staged by one key change.

use bkt_types::{BucketIdx, DataType, DeviceIdx, Generation, KeyPos};
use bkt_usage::FsUsageDelta;

/// Which epoch a staged key change is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkMode {
    /// An ordinary transaction commit. Dirty pointers in a new key must be
    /// current.
    #[default]
    Commit,
    /// The gc scan rebuilding its epoch. Stale pointers are counted and
    /// skipped, never an error.
    Gc,
}

/// Sector change for one pointer's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDelta {
    pub dev: DeviceIdx,
    pub bucket: BucketIdx,
    /// Generation recorded in the pointer; re-checked at commit.
    pub ptr_gen: Generation,
    pub data_type: DataType,
    pub dirty: i64,
    pub cached: i64,
}

impl BucketDelta {
    #[must_use]
    pub fn negated(&self) -> Self {
        Self {
            dirty: -self.dirty,
            cached: -self.cached,
            ..*self
        }
    }
}

/// Everything one key change does to bucket marks and filesystem usage.
///
/// Owned by the transaction attempt that computed it. A restart throws it
/// away and recomputes from the current key state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicasDeltaList {
    pub(crate) pos: Option<KeyPos>,
    pub(crate) usage: FsUsageDelta,
    pub(crate) buckets: Vec<BucketDelta>,
    pub(crate) stale: u64,
}

impl ReplicasDeltaList {
    #[must_use]
    pub fn new(pos: Option<KeyPos>) -> Self {
        Self {
            pos,
            ..Self::default()
        }
    }

    /// Position of the key this list was computed for.
    #[must_use]
    pub fn pos(&self) -> Option<KeyPos> {
        self.pos
    }

    #[must_use]
    pub fn usage(&self) -> &FsUsageDelta {
        &self.usage
    }

    #[must_use]
    pub fn buckets(&self) -> &[BucketDelta] {
        &self.buckets
    }

    /// Pointers skipped because their bucket moved past them.
    #[must_use]
    pub fn stale(&self) -> u64 {
        self.stale
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.usage.is_empty() && self.buckets.is_empty()
    }
}

/// Sum of the usage deltas of `lists`.
#[must_use]
pub fn total_usage(lists: &[ReplicasDeltaList]) -> FsUsageDelta {
    let mut total = FsUsageDelta::new();
    for list in lists {
        total.merge(&list.usage);
    }
    total
}
