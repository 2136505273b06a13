#![forbid(unsafe_code)]
//! Per-device bucket state: the generation store and the two-epoch mark
//! store.
//!
//! Each device owns three RCU-published arrays:
//!
//! - `live`: the marks ordinary traffic reads and mutates,
//! - `gc`: present only while a gc scan rebuilds marks from the btree,
//! - `gens`: one generation byte per bucket, checked by pointer resolution.
//!
//! Every mark mutation goes through [`DeviceBuckets::cas_mark`]. Array
//! replacement (resize, gc publish) happens under the exclusive mark lock and
//! old arrays are freed when the last reader holding them lets go.
//!
//! # Logging
//!
//! - **TRACE** `bkt::buckets`: `cas_mark_retry` (lost a compare-exchange race)
//! - **DEBUG** `bkt::buckets`: `gc_epoch_start`, `gc_epoch_abort`
//! - **INFO** `bkt::buckets`: `device_buckets_resize`, `gc_epoch_publish`
//! - **ERROR** `bkt::buckets`: `cas_mark_overflow` (a mutation would exceed the bucket size)

mod array;
mod locks;
mod rcu;

pub use array::{Bucket, BucketArray, BucketGens};
pub use locks::{
    BucketLockGuard, FsId, GcGuard, MarkAccess, MarkLocks, MarkReadGuard, MarkWriteGuard,
};

use bkt_error::{Result, SpaceError};
use bkt_types::{BucketIdx, BucketMark, DeviceGeometry, DeviceIdx, Generation};
use parking_lot::Mutex;
use rcu::ArraySlot;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace};

/// Which epoch of the mark array an access targets.
///
/// The gc epoch can only be named together with a guard proving the caller
/// holds a lock that keeps it from being swapped or freed underneath them.
#[derive(Clone, Copy)]
pub enum MarkView<'g> {
    Live,
    Gc(&'g dyn MarkAccess),
}

impl std::fmt::Debug for MarkView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => f.write_str("Live"),
            Self::Gc(_) => f.write_str("Gc"),
        }
    }
}

/// Result of a successful [`DeviceBuckets::cas_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkUpdate {
    pub old: BucketMark,
    pub new: BucketMark,
}

impl MarkUpdate {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

/// Compare-exchange counters, for contention diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CasStats {
    pub updates: u64,
    pub retries: u64,
}

/// A bucket whose live and rebuilt marks disagree at gc publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkMismatch {
    pub bucket: BucketIdx,
    pub live: BucketMark,
    pub rebuilt: BucketMark,
}

pub struct DeviceBuckets {
    fs: FsId,
    dev: DeviceIdx,
    live: ArraySlot<BucketArray>,
    gc: ArraySlot<BucketArray>,
    gens: ArraySlot<BucketGens>,
    bucket_lock: Mutex<()>,
    cas_updates: AtomicU64,
    cas_retries: AtomicU64,
}

impl std::fmt::Debug for DeviceBuckets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuckets")
            .field("dev", &self.dev)
            .field("geometry", &self.geometry())
            .field("gc_active", &self.gc.is_present())
            .finish_non_exhaustive()
    }
}

impl DeviceBuckets {
    /// Empty arrays for a freshly added device.
    pub fn new(locks: &MarkLocks, dev: DeviceIdx, geometry: DeviceGeometry) -> Result<Self> {
        geometry
            .validate()
            .map_err(|e| SpaceError::InvalidGeometry(e.to_string()))?;
        let array = BucketArray::new(geometry);
        let gens = BucketGens::from_array(&array);
        Ok(Self {
            fs: locks.fs_id(),
            dev,
            live: ArraySlot::new("live", array),
            gc: ArraySlot::empty("gc"),
            gens: ArraySlot::new("gens", gens),
            bucket_lock: Mutex::new(()),
            cas_updates: AtomicU64::new(0),
            cas_retries: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn dev(&self) -> DeviceIdx {
        self.dev
    }

    #[must_use]
    pub fn geometry(&self) -> DeviceGeometry {
        self.live.load().as_deref().map_or(
            DeviceGeometry {
                bucket_size: 0,
                nbuckets: 0,
                first_bucket: 0,
            },
            BucketArray::geometry,
        )
    }

    /// Per-device bucket lock, the third way to gain gc-epoch access.
    pub fn lock_buckets(&self) -> BucketLockGuard<'_> {
        BucketLockGuard {
            fs: self.fs,
            dev: self.dev,
            _guard: self.bucket_lock.lock(),
        }
    }

    #[must_use]
    pub fn gc_active(&self) -> bool {
        self.gc.is_present()
    }

    /// The live array. Holding the `Arc` keeps it readable after a swap, but
    /// mutations made through a retired array are lost.
    pub fn live_array(&self) -> Result<Arc<BucketArray>> {
        self.live
            .load_full()
            .ok_or_else(|| SpaceError::CorruptUsageState(format!("device {} has no live array", self.dev)))
    }

    pub fn gc_array(&self, access: &dyn MarkAccess) -> Result<Arc<BucketArray>> {
        self.check_access(access);
        self.gc.load_full().ok_or(SpaceError::GcNotRunning)
    }

    fn check_access(&self, access: &dyn MarkAccess) {
        debug_assert!(
            access.covers(self.fs, self.dev),
            "gc-epoch access to device {} without a covering guard",
            self.dev
        );
    }

    fn with_array<R>(&self, view: MarkView<'_>, f: impl FnOnce(&BucketArray) -> Result<R>) -> Result<R> {
        let slot = match view {
            MarkView::Live => &self.live,
            MarkView::Gc(access) => {
                self.check_access(access);
                &self.gc
            }
        };
        let guard = slot.load();
        match guard.as_deref() {
            Some(array) => f(array),
            None if matches!(view, MarkView::Gc(_)) => Err(SpaceError::GcNotRunning),
            None => Err(SpaceError::CorruptUsageState(format!(
                "device {} has no live array",
                self.dev
            ))),
        }
    }

    fn out_of_range(&self, bucket: BucketIdx, nbuckets: u64) -> SpaceError {
        SpaceError::BucketOutOfRange {
            dev: self.dev.0,
            bucket: bucket.0,
            nbuckets,
        }
    }

    pub fn read_mark(&self, bucket: BucketIdx, view: MarkView<'_>) -> Result<BucketMark> {
        self.with_array(view, |array| {
            array
                .get(bucket)
                .map(Bucket::mark)
                .ok_or_else(|| self.out_of_range(bucket, array.nbuckets()))
        })
    }

    /// Atomically replace the mark of `bucket` with `f(current)`.
    ///
    /// `f` may run several times; it must be a pure function of its input.
    /// If `f` fails, or its result would hold more sectors than the bucket
    /// size, nothing is stored. An unchanged result skips the exchange.
    pub fn cas_mark<F>(&self, bucket: BucketIdx, view: MarkView<'_>, mut f: F) -> Result<MarkUpdate>
    where
        F: FnMut(BucketMark) -> Result<BucketMark>,
    {
        self.with_array(view, |array| {
            let bucket_size = array.geometry().bucket_size;
            let slot = array
                .get(bucket)
                .ok_or_else(|| self.out_of_range(bucket, array.nbuckets()))?;
            let mut current = slot.mark.load(Ordering::Acquire);
            loop {
                let old = BucketMark::from_raw(current);
                let new = f(old)?;
                if !new.fits(bucket_size) {
                    error!(
                        target: "bkt::buckets",
                        dev = self.dev.0,
                        bucket = bucket.0,
                        dirty = new.dirty_sectors(),
                        cached = new.cached_sectors(),
                        bucket_size,
                        "cas_mark_overflow"
                    );
                    return Err(SpaceError::CorruptUsageState(format!(
                        "bucket {}:{} would hold {} sectors, bucket size {bucket_size}",
                        self.dev,
                        bucket,
                        new.total_sectors()
                    )));
                }
                if new == old {
                    return Ok(MarkUpdate { old, new });
                }
                match slot.mark.compare_exchange_weak(
                    current,
                    new.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.cas_updates.fetch_add(1, Ordering::Relaxed);
                        return Ok(MarkUpdate { old, new });
                    }
                    Err(observed) => {
                        self.cas_retries.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            target: "bkt::buckets",
                            dev = self.dev.0,
                            bucket = bucket.0,
                            "cas_mark_retry"
                        );
                        current = observed;
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn cas_stats(&self) -> CasStats {
        CasStats {
            updates: self.cas_updates.load(Ordering::Relaxed),
            retries: self.cas_retries.load(Ordering::Relaxed),
        }
    }

    // ── Generations ─────────────────────────────────────────────────────────

    /// Current generation of `bucket` from the generation store.
    pub fn bucket_gen(&self, bucket: BucketIdx) -> Result<Generation> {
        let gens = self.gens.load();
        let gens = gens
            .as_deref()
            .ok_or_else(|| SpaceError::CorruptUsageState(format!("device {} has no gens array", self.dev)))?;
        gens.get(bucket)
            .ok_or_else(|| self.out_of_range(bucket, gens.len()))
    }

    /// How many generations `bucket` has moved past `ptr_gen`; non-zero
    /// means a pointer recorded at `ptr_gen` is stale.
    pub fn ptr_stale(&self, bucket: BucketIdx, ptr_gen: Generation) -> Result<u8> {
        Ok(self.bucket_gen(bucket)?.distance_after(ptr_gen))
    }

    pub fn is_stale(&self, bucket: BucketIdx, ptr_gen: Generation) -> Result<bool> {
        Ok(self.bucket_gen(bucket)?.makes_stale(ptr_gen))
    }

    /// `Err(StaleReference)` when a pointer at `ptr_gen` no longer matches.
    pub fn check_ptr(&self, bucket: BucketIdx, ptr_gen: Generation) -> Result<()> {
        let bucket_gen = self.bucket_gen(bucket)?;
        if bucket_gen.makes_stale(ptr_gen) {
            return Err(SpaceError::StaleReference {
                dev: self.dev.0,
                bucket: bucket.0,
                ptr_gen: ptr_gen.0,
                bucket_gen: bucket_gen.0,
            });
        }
        Ok(())
    }

    /// Record a new generation in the generation store. Called after the
    /// mark's generation has been advanced.
    pub fn publish_generation(&self, bucket: BucketIdx, generation: Generation) -> Result<()> {
        let gens = self.gens.load();
        let gens = gens
            .as_deref()
            .ok_or_else(|| SpaceError::CorruptUsageState(format!("device {} has no gens array", self.dev)))?;
        if gens.set(bucket, generation) {
            Ok(())
        } else {
            Err(self.out_of_range(bucket, gens.len()))
        }
    }

    /// `gen - oldest_gen` in wrapping arithmetic: how far the oldest
    /// surviving pointer into `bucket` lags behind it.
    pub fn gc_gen_distance(&self, bucket: BucketIdx) -> Result<u8> {
        self.with_array(MarkView::Live, |array| {
            let b = array
                .get(bucket)
                .ok_or_else(|| self.out_of_range(bucket, array.nbuckets()))?;
            Ok(b.mark().generation().0.wrapping_sub(b.oldest_gen().0))
        })
    }

    pub fn oldest_gen(&self, bucket: BucketIdx, view: MarkView<'_>) -> Result<Generation> {
        self.with_array(view, |array| {
            array
                .get(bucket)
                .map(Bucket::oldest_gen)
                .ok_or_else(|| self.out_of_range(bucket, array.nbuckets()))
        })
    }

    /// Lower `oldest_gen` to `ptr_gen` if the pointer is older than anything
    /// seen so far. Used by the gc scan on its own epoch.
    pub fn note_ptr_gen(&self, bucket: BucketIdx, ptr_gen: Generation, view: MarkView<'_>) -> Result<()> {
        self.with_array(view, |array| {
            let b = array
                .get(bucket)
                .ok_or_else(|| self.out_of_range(bucket, array.nbuckets()))?;
            let mut current = b.oldest_gen.load(Ordering::Acquire);
            while Generation(current).makes_stale(ptr_gen) {
                match b.oldest_gen.compare_exchange_weak(
                    current,
                    ptr_gen.0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
            Ok(())
        })
    }

    /// Mount-time load of one bucket's persisted generation information.
    pub fn load_alloc_info(&self, bucket: BucketIdx, generation: Generation, oldest_gen: Generation) -> Result<()> {
        self.cas_mark(bucket, MarkView::Live, |m| Ok(m.with_generation(generation)))?;
        self.with_array(MarkView::Live, |array| {
            if let Some(b) = array.get(bucket) {
                b.store_oldest_gen(oldest_gen);
            }
            Ok(())
        })?;
        self.publish_generation(bucket, generation)
    }

    // ── Array replacement ───────────────────────────────────────────────────

    /// Publish arrays sized for `geometry`. Live marks and generations are
    /// copied; dropped buckets must be empty and unowned.
    ///
    /// The caller holds the gc lock and the exclusive mark lock, so no gc
    /// epoch is being built and no commit is mutating the live array.
    pub fn resize(&self, geometry: DeviceGeometry, _gc: &GcGuard<'_>, _marks: &MarkWriteGuard<'_>) -> Result<()> {
        geometry
            .validate()
            .map_err(|e| SpaceError::InvalidGeometry(e.to_string()))?;
        if self.gc.is_present() {
            return Err(SpaceError::DeviceBusy {
                dev: self.dev.0,
                detail: "gc epoch active".to_owned(),
            });
        }
        let live = self.live_array()?;
        let old = live.geometry();
        if geometry.bucket_size != old.bucket_size {
            return Err(SpaceError::InvalidGeometry(format!(
                "bucket size cannot change on resize ({} -> {})",
                old.bucket_size, geometry.bucket_size
            )));
        }
        if let Some((idx, b)) = live
            .iter()
            .skip_while(|(idx, _)| idx.0 < geometry.nbuckets)
            .find(|(_, b)| {
                let m = b.mark();
                m.total_sectors() != 0 || m.owned_by_allocator() || m.stripe()
            })
        {
            return Err(SpaceError::DeviceBusy {
                dev: self.dev.0,
                detail: format!("bucket {idx} in use: {:?}", b.mark()),
            });
        }

        let next = BucketArray::resized(&live, geometry);
        let gens = BucketGens::from_array(&next);
        self.live.publish(Arc::new(next));
        self.gens.publish(Arc::new(gens));
        info!(
            target: "bkt::buckets",
            dev = self.dev.0,
            old_nbuckets = old.nbuckets,
            new_nbuckets = geometry.nbuckets,
            first_bucket = geometry.first_bucket,
            "device_buckets_resize"
        );
        Ok(())
    }

    /// Create the gc epoch as a generation-only copy of live.
    pub fn start_gc(&self, _gc: &GcGuard<'_>) -> Result<()> {
        let live = self.live_array()?;
        if self.gc.is_present() {
            return Err(SpaceError::DeviceBusy {
                dev: self.dev.0,
                detail: "gc epoch already exists".to_owned(),
            });
        }
        self.gc.publish(Arc::new(BucketArray::gc_copy_of(&live)));
        debug!(target: "bkt::buckets", dev = self.dev.0, nbuckets = live.nbuckets(), "gc_epoch_start");
        Ok(())
    }

    /// Drop an unfinished gc epoch.
    pub fn abort_gc(&self, _gc: &GcGuard<'_>) {
        if let Some(old) = self.gc.take() {
            rcu::retire("gc", old);
            debug!(target: "bkt::buckets", dev = self.dev.0, "gc_epoch_abort");
        }
    }

    /// Swap the rebuilt gc epoch in as live.
    ///
    /// Allocator ownership, stripe membership, and generations are not
    /// derived from keys, so they are carried over from live first. Returns
    /// every bucket whose remaining fields disagreed.
    pub fn publish_gc(&self, _marks: &MarkWriteGuard<'_>) -> Result<Vec<MarkMismatch>> {
        let rebuilt = self.gc.take().ok_or(SpaceError::GcNotRunning)?;
        let live = self.live_array()?;
        let rebuilt_n = rebuilt.nbuckets();
        if rebuilt_n != live.nbuckets() {
            rcu::retire("gc", rebuilt);
            return Err(SpaceError::CorruptUsageState(format!(
                "device {}: gc epoch has {rebuilt_n} buckets, live has {}",
                self.dev,
                live.nbuckets()
            )));
        }

        let mut mismatches = Vec::new();
        for ((idx, live_b), (_, gc_b)) in live.iter().zip(rebuilt.iter()) {
            let l = live_b.mark();
            let carried = gc_b
                .mark()
                .with_generation(l.generation())
                .with_owned_by_allocator(l.owned_by_allocator())
                .with_stripe(l.stripe());
            gc_b.store_mark(carried);
            if carried != l {
                mismatches.push(MarkMismatch {
                    bucket: idx,
                    live: l,
                    rebuilt: carried,
                });
            }
        }

        self.live.publish(rebuilt);
        info!(
            target: "bkt::buckets",
            dev = self.dev.0,
            nbuckets = rebuilt_n,
            mismatches = mismatches.len(),
            "gc_epoch_publish"
        );
        Ok(mismatches)
    }
}
