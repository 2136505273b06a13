//! Filesystem-wide mark locks and the typed guards that prove a caller holds
//! one of them.
//!
//! Reading or mutating the gc epoch of a bucket array requires one of:
//!
//! - the shared mark lock ([`MarkReadGuard`] or [`MarkWriteGuard`]),
//! - the gc exclusion lock ([`GcGuard`]),
//! - the device's bucket lock ([`BucketLockGuard`]).
//!
//! APIs that need the precondition take `&dyn MarkAccess`, so the check is a
//! type error rather than a comment. The live epoch needs no guard.
//!
//! The shared mark lock is also the commit window: transactions apply their
//! deltas under the read side, while gc steps and layout changes (replicas
//! table growth, array swaps) take the write side.

use bkt_types::DeviceIdx;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the filesystem a lock set belongs to, so a guard from one
/// filesystem cannot vouch for another's arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsId(u64);

mod sealed {
    pub trait Sealed {}
}

/// Proof that the caller holds a lock permitting gc-epoch access.
pub trait MarkAccess: sealed::Sealed {
    /// Whether this guard covers `dev` of filesystem `fs`.
    fn covers(&self, fs: FsId, dev: DeviceIdx) -> bool;
}

#[derive(Debug)]
pub struct MarkLocks {
    id: FsId,
    mark_lock: RwLock<()>,
    gc_lock: Mutex<()>,
}

impl Default for MarkLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkLocks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: FsId(NEXT_FS_ID.fetch_add(1, Ordering::Relaxed)),
            mark_lock: RwLock::new(()),
            gc_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn fs_id(&self) -> FsId {
        self.id
    }

    /// Shared side of the mark lock: the transaction commit window.
    pub fn read_marks(&self) -> MarkReadGuard<'_> {
        MarkReadGuard {
            fs: self.id,
            _guard: self.mark_lock.read(),
        }
    }

    /// Exclusive side: gc steps, array swaps, replicas layout changes.
    pub fn write_marks(&self) -> MarkWriteGuard<'_> {
        MarkWriteGuard {
            fs: self.id,
            _guard: self.mark_lock.write(),
        }
    }

    /// Held for the whole of a gc run; also excludes array resizes.
    pub fn lock_gc(&self) -> GcGuard<'_> {
        GcGuard {
            fs: self.id,
            _guard: self.gc_lock.lock(),
        }
    }

    pub fn try_lock_gc(&self) -> Option<GcGuard<'_>> {
        self.gc_lock.try_lock().map(|guard| GcGuard {
            fs: self.id,
            _guard: guard,
        })
    }
}

pub struct MarkReadGuard<'a> {
    fs: FsId,
    _guard: RwLockReadGuard<'a, ()>,
}

pub struct MarkWriteGuard<'a> {
    fs: FsId,
    _guard: RwLockWriteGuard<'a, ()>,
}

pub struct GcGuard<'a> {
    fs: FsId,
    _guard: MutexGuard<'a, ()>,
}

/// Per-device bucket lock, see [`crate::DeviceBuckets::lock_buckets`].
pub struct BucketLockGuard<'a> {
    pub(crate) fs: FsId,
    pub(crate) dev: DeviceIdx,
    pub(crate) _guard: MutexGuard<'a, ()>,
}

impl MarkReadGuard<'_> {
    #[must_use]
    pub fn fs_id(&self) -> FsId {
        self.fs
    }
}

impl MarkWriteGuard<'_> {
    #[must_use]
    pub fn fs_id(&self) -> FsId {
        self.fs
    }
}

impl sealed::Sealed for MarkReadGuard<'_> {}
impl sealed::Sealed for MarkWriteGuard<'_> {}
impl sealed::Sealed for GcGuard<'_> {}
impl sealed::Sealed for BucketLockGuard<'_> {}

impl MarkAccess for MarkReadGuard<'_> {
    fn covers(&self, fs: FsId, _dev: DeviceIdx) -> bool {
        self.fs == fs
    }
}

impl MarkAccess for MarkWriteGuard<'_> {
    fn covers(&self, fs: FsId, _dev: DeviceIdx) -> bool {
        self.fs == fs
    }
}

impl MarkAccess for GcGuard<'_> {
    fn covers(&self, fs: FsId, _dev: DeviceIdx) -> bool {
        self.fs == fs
    }
}

impl MarkAccess for BucketLockGuard<'_> {
    fn covers(&self, fs: FsId, dev: DeviceIdx) -> bool {
        self.fs == fs && self.dev == dev
    }
}

macro_rules! guard_debug {
    ($($ty:ident),*) => {
        $(impl fmt::Debug for $ty<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty)).field("fs", &self.fs).finish_non_exhaustive()
            }
        })*
    };
}

guard_debug!(MarkReadGuard, MarkWriteGuard, GcGuard, BucketLockGuard);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_only_cover_their_own_filesystem() {
        let a = MarkLocks::new();
        let b = MarkLocks::new();
        let guard = a.read_marks();
        assert!(guard.covers(a.fs_id(), DeviceIdx(0)));
        assert!(!guard.covers(b.fs_id(), DeviceIdx(0)));
    }

    #[test]
    fn gc_lock_is_exclusive() {
        let locks = MarkLocks::new();
        let held = locks.lock_gc();
        assert!(locks.try_lock_gc().is_none());
        drop(held);
        assert!(locks.try_lock_gc().is_some());
    }

    #[test]
    fn readers_share_the_mark_lock() {
        let locks = MarkLocks::new();
        let r1 = locks.read_marks();
        let r2 = locks.read_marks();
        assert_eq!(r1.fs_id(), r2.fs_id());
    }
}
