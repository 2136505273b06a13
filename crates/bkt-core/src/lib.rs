#![forbid(unsafe_code)]
//! Filesystem-wide space state.
//!
//! [`FsSpace`] owns everything the accounting core shares across callers:
//! the mark locks, the registered devices with their bucket arrays and
//! usage counters, the freelists behind one short-held mutex, filesystem
//! usage, and the reservation pool. It is passed by reference into the
//! marking engine and the gc scan; there is no global state.
//!
//! Lock order, outermost first: gc lock, a device's bucket lock, the mark
//! lock, the key store, the freelist mutex. The freelist mutex is never held
//! across a mark update.
//!
//! # Logging
//!
//! - **DEBUG** `bkt::core`: `bucket_invalidate`, `freelist_refill`, `bucket_release`,
//!   `metadata_mark`, `usage_fold`
//! - **INFO** `bkt::core`: `device_add`, `device_remove`, `device_resize`, `device_state`,
//!   `device_evacuate_cached`
//! - **WARN** `bkt::core`: `evacuate_skip`
//! - **ERROR** `bkt::core`: `fs_read_only`, `bucket_not_open`
//! - **INFO** `bkt::gc`: `gc_publish`; **WARN** `bkt::gc`: `gc_mark_mismatch`

mod config;
mod device;
mod keys;
mod marks;
mod report;

pub use config::SpaceConfig;
pub use device::{Device, DeviceState, MetadataMark, metadata_layout};
pub use keys::{KeySource, KeyStore, KeyVersion, MemKeyStore};
pub use marks::{GcPos, add_sectors};
pub use report::{DeviceSnapshot, SpaceSnapshot, dev_usage_to_text, fs_usage_to_text};

use bkt_alloc::{DeviceFreelists, FreelistStats, OpenBucket, ReclaimCandidate, Reserve, select_reclaim_candidates};
use bkt_buckets::{GcGuard, MarkLocks, MarkUpdate, MarkView, MarkWriteGuard};
use bkt_error::{Result, SpaceError};
use bkt_types::{
    BUCKET_GC_GEN_MAX, BucketIdx, BucketMark, DataType, DeviceIdx, Generation, KeyPos, MemberInfo, ReplicasEntry,
};
use bkt_usage::{
    DevUsage, DiskReservation, FsUsage, FsUsageAccumulator, FsUsageDelta, FsUsageShort, ReservationPool, ReserveMode,
    UsageMismatch,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

/// How the write into an open bucket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Data is on disk and its keys are committed; the bucket is closed.
    Written,
    /// Nothing was committed; the bucket goes back to its tier unchanged.
    Aborted,
}

/// What publishing a gc epoch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcPublish {
    pub buckets_mismatched: usize,
    pub usage_mismatches: Vec<UsageMismatch>,
}

#[derive(Debug, Default)]
struct GcState {
    cursor: Option<GcPos>,
    totals: FsUsageDelta,
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: usize) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

fn busy(dev: DeviceIdx, detail: impl Into<String>) -> SpaceError {
    SpaceError::DeviceBusy {
        dev: dev.0,
        detail: detail.into(),
    }
}

pub struct FsSpace {
    config: SpaceConfig,
    shard_count: usize,
    locks: MarkLocks,
    devices: RwLock<BTreeMap<DeviceIdx, Arc<Device>>>,
    freelists: Mutex<BTreeMap<DeviceIdx, DeviceFreelists>>,
    /// Serializes invalidations so incoming-queue room checked up front is
    /// still there when the bucket is pushed.
    invalidate_lock: Mutex<()>,
    usage: Arc<FsUsageAccumulator>,
    reservations: Arc<ReservationPool>,
    gc: Mutex<GcState>,
    commits: AtomicU64,
    /// Bucket generations of removed devices. Re-adding the index starts
    /// every bucket past them, so pointers into the old device stay stale.
    retired_gens: Mutex<BTreeMap<DeviceIdx, Vec<Generation>>>,
}

impl std::fmt::Debug for FsSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsSpace")
            .field("devices", &self.devices.read().len())
            .field("capacity", &self.capacity())
            .field("read_only", &self.is_read_only())
            .field("gc_pos", &self.gc_pos())
            .finish_non_exhaustive()
    }
}

impl FsSpace {
    pub fn new(config: SpaceConfig) -> Result<Self> {
        config.validate()?;
        let shard_count = config.effective_shard_count();
        let usage = Arc::new(FsUsageAccumulator::new(shard_count));
        let reservations = Arc::new(ReservationPool::new(
            Arc::clone(&usage),
            config.reserve_factor_shift,
        ));
        Ok(Self {
            config,
            shard_count,
            locks: MarkLocks::new(),
            devices: RwLock::new(BTreeMap::new()),
            freelists: Mutex::new(BTreeMap::new()),
            invalidate_lock: Mutex::new(()),
            usage,
            reservations,
            gc: Mutex::new(GcState::default()),
            commits: AtomicU64::new(0),
            retired_gens: Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    #[must_use]
    pub fn locks(&self) -> &MarkLocks {
        &self.locks
    }

    #[must_use]
    pub fn usage(&self) -> &FsUsageAccumulator {
        &self.usage
    }

    #[must_use]
    pub fn reservations(&self) -> &Arc<ReservationPool> {
        &self.reservations
    }

    // ── Devices ─────────────────────────────────────────────────────────────

    pub fn device(&self, dev: DeviceIdx) -> Result<Arc<Device>> {
        self.devices
            .read()
            .get(&dev)
            .cloned()
            .ok_or(SpaceError::DeviceNotFound { dev: dev.0 })
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    /// Sectors across all read-write devices.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.reservations.capacity()
    }

    fn recompute_capacity(&self) {
        let capacity = self
            .devices
            .read()
            .values()
            .filter(|d| d.state().allocates())
            .map(|d| d.geometry().capacity_sectors())
            .sum();
        self.reservations.set_capacity(capacity);
    }

    fn with_freelists<R>(&self, dev: DeviceIdx, f: impl FnOnce(&mut DeviceFreelists) -> Result<R>) -> Result<R> {
        let mut freelists = self.freelists.lock();
        let lists = freelists
            .get_mut(&dev)
            .ok_or(SpaceError::DeviceNotFound { dev: dev.0 })?;
        f(lists)
    }

    /// Register a device and mark its superblock and journal buckets.
    pub fn add_device(&self, dev: DeviceIdx, member: MemberInfo, state: DeviceState) -> Result<Arc<Device>> {
        let _gc = self.locks.lock_gc();
        let device = Arc::new(Device::new(
            &self.locks,
            dev,
            member,
            state,
            self.shard_count,
        )?);
        {
            let mut devices = self.devices.write();
            if devices.contains_key(&dev) {
                return Err(SpaceError::DeviceExists { dev: dev.0 });
            }
            devices.insert(dev, Arc::clone(&device));
        }
        self.freelists.lock().insert(
            dev,
            DeviceFreelists::new(dev, self.config.freelist, self.config.max_open_buckets),
        );
        let retired = self.retired_gens.lock().remove(&dev);
        let reseeded = retired
            .as_deref()
            .map_or(Ok(0), |gens| self.reseed_gens(&device, gens))
            .and_then(|n| self.mark_dev_superblock(dev).map(|()| n));
        let reseeded = match reseeded {
            Ok(n) => n,
            Err(e) => {
                self.devices.write().remove(&dev);
                self.freelists.lock().remove(&dev);
                if let Some(gens) = retired {
                    self.retired_gens.lock().insert(dev, gens);
                }
                return Err(e);
            }
        };
        self.recompute_capacity();
        let geometry = device.geometry();
        info!(
            target: "bkt::core",
            dev = dev.0,
            nbuckets = geometry.nbuckets,
            bucket_size = geometry.bucket_size,
            first_bucket = geometry.first_bucket,
            state = state.name(),
            reseeded,
            "device_add"
        );
        Ok(device)
    }

    /// Start each bucket of a re-added device one generation past where the
    /// removed device left it.
    fn reseed_gens(&self, device: &Device, gens: &[Generation]) -> Result<usize> {
        let _marks = self.locks.write_marks();
        let nbuckets = device.geometry().nbuckets;
        let mut reseeded = 0;
        for (i, old) in (0..nbuckets).zip(gens) {
            let next = old.next();
            device.buckets().load_alloc_info(BucketIdx(i), next, next)?;
            reseeded += 1;
        }
        Ok(reseeded)
    }

    /// Unregister a device. Refused while it has open buckets or holds any
    /// sectors besides its own superblock and journal.
    pub fn remove_device(&self, dev: DeviceIdx) -> Result<()> {
        let _gc = self.locks.lock_gc();
        let marks = self.locks.write_marks();
        let device = self.device(dev)?;
        let open = self.with_freelists(dev, |l| Ok(l.open_len()))?;
        if open > 0 {
            return Err(busy(dev, format!("{open} open buckets")));
        }
        let usage = device.usage();
        if let Some(data_type) = DataType::ALL
            .into_iter()
            .filter(|t| *t != DataType::None && !t.is_fixed_metadata())
            .find(|t| usage.data_type(*t).sectors > 0)
        {
            return Err(busy(
                dev,
                format!("{} {data_type} sectors on device", usage.data_type(data_type).sectors),
            ));
        }
        let gens: Vec<Generation> = device
            .buckets()
            .live_array()?
            .iter()
            .map(|(_, b)| b.mark().generation())
            .collect();
        let mut delta = FsUsageDelta::new();
        for r in self
            .usage
            .read_consistent()
            .replicas
            .iter()
            .filter(|r| r.sectors > 0 && r.entry.references(dev))
        {
            if !r.entry.data_type.is_fixed_metadata() {
                return Err(busy(dev, format!("replicas entry {} holds {} sectors", r.entry, r.sectors)));
            }
            delta.add_replicas(&r.entry, -to_i64(r.sectors));
        }
        self.usage.add_exclusive(&delta, &marks)?;
        self.devices.write().remove(&dev);
        self.retired_gens.lock().insert(dev, gens);
        let queued = self
            .freelists
            .lock()
            .remove(&dev)
            .map_or(0, |mut l| l.drain_queued().len());
        drop(marks);
        self.recompute_capacity();
        info!(target: "bkt::core", dev = dev.0, queued_dropped = queued, "device_remove");
        Ok(())
    }

    /// Grow or shrink a device to `nbuckets`. Shrinking is refused when a
    /// dropped bucket is in use, queued, or open.
    pub fn resize_device(&self, dev: DeviceIdx, nbuckets: u64) -> Result<()> {
        let gc = self.locks.lock_gc();
        let marks = self.locks.write_marks();
        let device = self.device(dev)?;
        let mut member = device.member();
        let old_nbuckets = member.geometry.nbuckets;
        member.geometry.nbuckets = nbuckets;
        member
            .validate()
            .map_err(|e| SpaceError::InvalidGeometry(e.to_string()))?;
        if let Some(bucket) = self.with_freelists(dev, |l| Ok(l.first_held_at_or_beyond(nbuckets)))? {
            return Err(busy(dev, format!("bucket {bucket} is queued or open")));
        }
        device.buckets().resize(member.geometry, &gc, &marks)?;
        device.truncate_metadata(nbuckets);
        device.set_member(member);
        device.rebuild_usage()?;
        drop(marks);
        self.recompute_capacity();
        info!(
            target: "bkt::core",
            dev = dev.0,
            old_nbuckets,
            new_nbuckets = nbuckets,
            "device_resize"
        );
        Ok(())
    }

    /// Returns the previous state.
    pub fn set_device_state(&self, dev: DeviceIdx, state: DeviceState) -> Result<DeviceState> {
        let device = self.device(dev)?;
        let old = device.set_state(state);
        if old != state {
            self.recompute_capacity();
            info!(
                target: "bkt::core",
                dev = dev.0,
                from = old.name(),
                to = state.name(),
                "device_state"
            );
        }
        Ok(old)
    }

    /// Mount-time load of persisted `(bucket, gen, oldest_gen)` triples.
    pub fn load_alloc_info(
        &self,
        dev: DeviceIdx,
        entries: impl IntoIterator<Item = (BucketIdx, Generation, Generation)>,
    ) -> Result<usize> {
        let device = self.device(dev)?;
        let _marks = self.locks.write_marks();
        let mut loaded = 0;
        for (bucket, generation, oldest_gen) in entries {
            device
                .buckets()
                .load_alloc_info(bucket, generation, oldest_gen)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    /// Open a bucket for writing, drawing from [`Reserve::None`] and then
    /// from each tier up to `reserve`.
    pub fn allocate(&self, dev: DeviceIdx, reserve: Reserve) -> Result<OpenBucket> {
        let device = self.device(dev)?;
        let state = device.state();
        if !state.allocates() {
            return Err(busy(dev, format!("device is {state}")));
        }
        self.with_freelists(dev, |l| l.pop(reserve))
    }

    /// Finish with an open bucket. A written bucket is closed and handed
    /// back from the allocator; an aborted one returns to its tier with its
    /// generation untouched.
    pub fn release_bucket(&self, dev: DeviceIdx, bucket: BucketIdx, outcome: WriteOutcome) -> Result<()> {
        let device = self.device(dev)?;
        let tier = self.with_freelists(dev, |l| {
            Ok(match outcome {
                WriteOutcome::Written => l.close(bucket),
                WriteOutcome::Aborted => l.return_open(bucket),
            })
        })?;
        let Some(tier) = tier else {
            error!(target: "bkt::core", dev = dev.0, bucket = bucket.0, ?outcome, "bucket_not_open");
            return Err(SpaceError::CorruptUsageState(format!(
                "release of bucket {dev}:{bucket}, which is not open"
            )));
        };
        if outcome == WriteOutcome::Written {
            let marks = self.locks.read_marks();
            device.update_mark(bucket, MarkView::Live, &marks, |m| {
                Ok(m.with_owned_by_allocator(false))
            })?;
        }
        debug!(
            target: "bkt::core",
            dev = dev.0,
            bucket = bucket.0,
            tier = tier.name(),
            ?outcome,
            "bucket_release"
        );
        Ok(())
    }

    /// Set or clear the allocator-ownership flag of a bucket.
    pub fn mark_alloc_bucket(&self, dev: DeviceIdx, bucket: BucketIdx, owned: bool) -> Result<MarkUpdate> {
        let device = self.device(dev)?;
        let marks = self.locks.read_marks();
        device.update_mark(bucket, MarkView::Live, &marks, |m| {
            Ok(m.with_owned_by_allocator(owned))
        })
    }

    /// Advance the generation of an available bucket, drop whatever cached
    /// data it held, and stage it on the incoming queue. Returns the new
    /// generation; pointers recorded at the old one are now stale.
    pub fn invalidate(&self, dev: DeviceIdx, bucket: BucketIdx) -> Result<Generation> {
        let device = self.device(dev)?;
        let _serial = self.invalidate_lock.lock();
        self.with_freelists(dev, |l| {
            if l.holds(bucket) {
                return Err(busy(dev, format!("bucket {bucket} already queued or open")));
            }
            if !l.incoming_has_room() {
                return Err(busy(dev, "incoming queue full"));
            }
            Ok(())
        })?;
        let generation = {
            let marks = self.locks.write_marks();
            self.invalidate_mark(&device, bucket, true, &marks)?
        };
        self.with_freelists(dev, |l| l.push_incoming(bucket))?;
        Ok(generation)
    }

    fn invalidate_mark(
        &self,
        device: &Device,
        bucket: BucketIdx,
        claim: bool,
        marks: &MarkWriteGuard<'_>,
    ) -> Result<Generation> {
        let dev = device.idx();
        let geometry = device.geometry();
        if !geometry.contains(bucket) {
            return Err(SpaceError::BucketOutOfRange {
                dev: dev.0,
                bucket: bucket.0,
                nbuckets: geometry.nbuckets,
            });
        }
        let distance = device.buckets().gc_gen_distance(bucket)?;
        if distance >= BUCKET_GC_GEN_MAX {
            return Err(busy(
                dev,
                format!("bucket {bucket} is {distance} generations past its oldest pointer, needs gc"),
            ));
        }
        let update = device.update_mark(bucket, MarkView::Live, marks, |m| {
            if !m.is_available() || m.data_type().is_fixed_metadata() {
                return Err(busy(dev, format!("bucket {bucket} in use: {m:?}")));
            }
            if m.owned_by_allocator() {
                return Err(busy(dev, format!("bucket {bucket} owned by allocator")));
            }
            Ok(BucketMark::EMPTY
                .with_generation(m.generation().next())
                .with_owned_by_allocator(claim))
        })?;
        let generation = update.new.generation();
        device.buckets().publish_generation(bucket, generation)?;

        let cached = ReplicasEntry::single(DataType::Cached, dev);
        let mut delta = FsUsageDelta::new();
        delta.add_replicas(&cached, -i64::from(update.old.cached_sectors()));
        if device.buckets().gc_active() {
            let gc_update = device.update_mark(bucket, MarkView::Gc(marks), marks, |m| {
                Ok(add_sectors(m, DataType::Cached, 0, -i64::from(m.cached_sectors()))?.with_generation(generation))
            })?;
            let mut gc_delta = FsUsageDelta::new();
            gc_delta.add_replicas(&cached, -i64::from(gc_update.old.cached_sectors()));
            self.gc_account(&gc_delta);
        }
        self.usage.add_exclusive(&delta, marks)?;
        debug!(
            target: "bkt::core",
            dev = dev.0,
            bucket = bucket.0,
            generation = generation.0,
            cached_dropped = update.old.cached_sectors(),
            claim,
            "bucket_invalidate"
        );
        Ok(generation)
    }

    /// Invalidate the cheapest reclaimable buckets until the incoming queue
    /// is full. Returns how many were staged.
    pub fn refill_freelists(&self, dev: DeviceIdx) -> Result<usize> {
        let device = self.device(dev)?;
        let _serial = self.invalidate_lock.lock();
        let room = self.with_freelists(dev, |l| {
            Ok(self.config.freelist.incoming.saturating_sub(l.stats().incoming))
        })?;
        if room == 0 {
            return Ok(0);
        }
        let live = device.buckets().live_array()?;
        let candidates = select_reclaim_candidates(
            live.iter_usable().filter_map(|(idx, b)| {
                let mark = b.mark();
                ReclaimCandidate::from_mark(idx, mark, mark.generation().0.wrapping_sub(b.oldest_gen().0))
            }),
            room,
        );
        drop(live);

        let mut staged = Vec::with_capacity(candidates.len());
        let mut failure = None;
        {
            let marks = self.locks.write_marks();
            for candidate in &candidates {
                match self.invalidate_mark(&device, candidate.bucket, true, &marks) {
                    Ok(_) => staged.push(candidate.bucket),
                    // Lost a race with a commit that put data in it.
                    Err(SpaceError::DeviceBusy { .. }) => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        self.with_freelists(dev, |l| {
            for bucket in &staged {
                l.push_incoming(*bucket)?;
            }
            Ok(())
        })?;
        debug!(
            target: "bkt::core",
            dev = dev.0,
            candidates = candidates.len(),
            staged = staged.len(),
            "freelist_refill"
        );
        match failure {
            Some(e) => Err(e),
            None => Ok(staged.len()),
        }
    }

    /// Move staged buckets onto the freelist tiers.
    pub fn promote_incoming(&self, dev: DeviceIdx) -> Result<Vec<OpenBucket>> {
        self.with_freelists(dev, |l| Ok(l.promote_incoming()))
    }

    /// Drop every cached-only bucket of a device: generations advance and
    /// the buckets become empty without being queued. Used before removing
    /// a device.
    pub fn evacuate_cached(&self, dev: DeviceIdx) -> Result<u64> {
        let device = self.device(dev)?;
        let _serial = self.invalidate_lock.lock();
        let marks = self.locks.write_marks();
        let live = device.buckets().live_array()?;
        let mut dropped = 0;
        for (idx, b) in live.iter_usable() {
            let m = b.mark();
            if m.cached_sectors() == 0 || !m.is_available() || m.owned_by_allocator() {
                continue;
            }
            match self.invalidate_mark(&device, idx, false, &marks) {
                Ok(_) => dropped += 1,
                Err(SpaceError::DeviceBusy { detail, .. }) => {
                    warn!(target: "bkt::core", dev = dev.0, bucket = idx.0, detail = %detail, "evacuate_skip");
                }
                Err(e) => return Err(e),
            }
        }
        info!(target: "bkt::core", dev = dev.0, dropped, "device_evacuate_cached");
        Ok(dropped)
    }

    // ── Reservations ────────────────────────────────────────────────────────

    pub fn reserve(&self, sectors: u64, nr_replicas: u32, mode: ReserveMode) -> Result<DiskReservation> {
        self.reservations.acquire(sectors, nr_replicas, mode)
    }

    /// Room for `nodes` btree nodes on each of `nr_replicas` devices.
    pub fn reserve_btree_nodes(&self, nodes: u32, nr_replicas: u32, mode: ReserveMode) -> Result<DiskReservation> {
        let sectors = u64::from(nodes) * u64::from(self.config.btree_node_sectors);
        self.reserve(sectors, nr_replicas, mode)
    }

    /// Latch the filesystem read-only if `err` is fatal. Hands `err` back.
    pub fn note_error(&self, err: SpaceError) -> SpaceError {
        if err.is_fatal() && self.reservations.set_read_only() {
            error!(target: "bkt::core", error = %err, "fs_read_only");
        }
        err
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.reservations.is_read_only()
    }

    // ── Usage reads ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn fs_usage(&self) -> FsUsage {
        self.usage.read_consistent()
    }

    #[must_use]
    pub fn fs_usage_short(&self) -> FsUsageShort {
        self.fs_usage()
            .short(self.capacity(), self.config.reserve_factor_shift)
    }

    pub fn dev_usage(&self, dev: DeviceIdx) -> Result<DevUsage> {
        Ok(self.device(dev)?.usage())
    }

    pub fn freelist_stats(&self, dev: DeviceIdx) -> Result<FreelistStats> {
        self.with_freelists(dev, |l| Ok(l.stats()))
    }

    pub fn available_buckets(&self, dev: DeviceIdx) -> Result<u64> {
        Ok(self.dev_usage(dev)?.buckets_available())
    }

    /// Available buckets not already queued or open; never negative.
    pub fn reclaimable_buckets(&self, dev: DeviceIdx) -> Result<u64> {
        let usage = self.dev_usage(dev)?;
        let stats = self.freelist_stats(dev)?;
        Ok(usage.buckets_reclaimable(to_u64(stats.queued()), to_u64(stats.open)))
    }

    #[must_use]
    pub fn snapshot(&self) -> SpaceSnapshot {
        let fs = self.fs_usage();
        let short = fs.short(self.capacity(), self.config.reserve_factor_shift);
        let stats: BTreeMap<DeviceIdx, FreelistStats> = self
            .freelists
            .lock()
            .iter()
            .map(|(dev, l)| (*dev, l.stats()))
            .collect();
        let devices = self
            .devices()
            .iter()
            .map(|d| DeviceSnapshot {
                dev: d.idx(),
                state: d.state(),
                usage: d.usage(),
                freelist: stats.get(&d.idx()).copied().unwrap_or_default(),
            })
            .collect();
        SpaceSnapshot {
            short,
            fs,
            devices,
            read_only: self.is_read_only(),
        }
    }

    /// Merge every accumulator's shards into its base.
    pub fn fold(&self) {
        self.usage.fold();
        for device in self.devices() {
            device.fold();
        }
        trace!(target: "bkt::core", "usage_fold");
    }

    /// Count one commit, folding every `fold_every_commits`.
    pub fn note_commit(&self) -> u64 {
        let n = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.config.fold_every_commits;
        if every != 0 && n % every == 0 {
            self.fold();
            debug!(target: "bkt::core", commits = n, "usage_fold");
        }
        n
    }

    // ── Fixed metadata ──────────────────────────────────────────────────────

    /// Grow the replicas layout for entries `delta` names that it lacks.
    /// Must not be called with the mark lock held.
    pub fn ensure_replicas(&self, delta: &FsUsageDelta) -> usize {
        let missing = self.usage.missing_entries(delta);
        if missing.is_empty() {
            return 0;
        }
        let marks = self.locks.write_marks();
        self.usage.ensure_entries(missing.iter(), &marks)
    }

    pub fn metadata_layout(&self, dev: DeviceIdx) -> Result<Vec<MetadataMark>> {
        Ok(metadata_layout(&self.device(dev)?.member()))
    }

    /// Immediately add `sectors` of superblock or journal to a bucket.
    /// Applied to the gc epoch too once the scan is past metadata.
    pub fn mark_metadata_bucket(
        &self,
        dev: DeviceIdx,
        bucket: BucketIdx,
        data_type: DataType,
        sectors: u32,
    ) -> Result<MarkUpdate> {
        if !data_type.is_fixed_metadata() {
            return Err(SpaceError::InvalidGeometry(format!(
                "{data_type} is not fixed metadata"
            )));
        }
        let device = self.device(dev)?;
        let mut delta = FsUsageDelta::new();
        delta.add_replicas(&ReplicasEntry::single(data_type, dev), i64::from(sectors));

        let bucket_lock = device.buckets().lock_buckets();
        self.ensure_replicas(&delta);
        let marks = self.locks.read_marks();
        let apply = |m| add_sectors(m, data_type, i64::from(sectors), 0);
        let update = device.update_mark(bucket, MarkView::Live, &marks, apply)?;
        device.record_metadata(bucket, data_type, sectors);
        self.usage.add(&delta, &marks)?;
        if self.gc_visited(GcPos::Metadata) {
            device.update_mark(bucket, MarkView::Gc(&bucket_lock), &marks, apply)?;
            self.gc_account(&delta);
        }
        debug!(
            target: "bkt::core",
            dev = dev.0,
            bucket = bucket.0,
            data_type = data_type.name(),
            sectors,
            "metadata_mark"
        );
        Ok(update)
    }

    /// Mark the superblock copies and journal buckets of `dev`. Done once,
    /// when the device is added.
    pub fn mark_dev_superblock(&self, dev: DeviceIdx) -> Result<()> {
        for m in self.metadata_layout(dev)? {
            self.mark_metadata_bucket(dev, m.bucket, m.data_type, m.sectors)?;
        }
        Ok(())
    }

    // ── Gc epoch ────────────────────────────────────────────────────────────

    /// Open a gc epoch on every device. The caller holds `gc` until
    /// [`finish_gc`](Self::finish_gc) or [`abort_gc`](Self::abort_gc).
    pub fn begin_gc(&self, gc: &GcGuard<'_>) -> Result<()> {
        let _marks = self.locks.write_marks();
        let devices = self.devices();
        for (i, device) in devices.iter().enumerate() {
            if let Err(e) = device.buckets().start_gc(gc) {
                for started in &devices[..i] {
                    started.buckets().abort_gc(gc);
                }
                return Err(e);
            }
        }
        *self.gc.lock() = GcState {
            cursor: Some(GcPos::Start),
            totals: FsUsageDelta::new(),
        };
        Ok(())
    }

    #[must_use]
    pub fn gc_pos(&self) -> Option<GcPos> {
        self.gc.lock().cursor
    }

    pub fn set_gc_pos(&self, pos: GcPos, _marks: &MarkWriteGuard<'_>) {
        if let Some(cursor) = &mut self.gc.lock().cursor {
            *cursor = pos;
        }
    }

    /// Whether the running gc scan has already folded `pos` into its epoch.
    /// Stable for as long as the caller holds the mark lock.
    #[must_use]
    pub fn gc_visited(&self, pos: GcPos) -> bool {
        self.gc.lock().cursor.is_some_and(|cursor| pos < cursor)
    }

    /// Fold `delta` into the totals the gc epoch will publish.
    pub fn gc_account(&self, delta: &FsUsageDelta) {
        let mut gc = self.gc.lock();
        if gc.cursor.is_some() {
            gc.totals.merge(delta);
        }
    }

    /// Mark every device's superblock and journal into the gc epoch and
    /// move the cursor past metadata. Runtime metadata marks count as much
    /// as the member info layout.
    pub fn mark_metadata_gc(&self, marks: &MarkWriteGuard<'_>) -> Result<()> {
        for device in self.devices() {
            let mut delta = FsUsageDelta::new();
            for m in device.metadata_marks() {
                device.update_mark(m.bucket, MarkView::Gc(marks), marks, |mark| {
                    add_sectors(mark, m.data_type, i64::from(m.sectors), 0)
                })?;
                delta.add_replicas(
                    &ReplicasEntry::single(m.data_type, device.idx()),
                    i64::from(m.sectors),
                );
            }
            self.gc_account(&delta);
        }
        self.set_gc_pos(GcPos::Key(KeyPos::MIN), marks);
        Ok(())
    }

    /// Publish every device's gc epoch as live, recount device usage from
    /// it, and install the rebuilt filesystem totals.
    pub fn finish_gc(&self, gc: &GcGuard<'_>) -> Result<GcPublish> {
        let marks = self.locks.write_marks();
        let totals = std::mem::take(&mut *self.gc.lock()).totals;
        let mut report = GcPublish::default();
        let devices = self.devices();
        for device in &devices {
            let published = device
                .buckets()
                .publish_gc(&marks)
                .and_then(|mismatches| device.rebuild_usage().map(|_| mismatches));
            let mismatches = match published {
                Ok(m) => m,
                Err(e) => {
                    for d in &devices {
                        d.buckets().abort_gc(gc);
                    }
                    return Err(e);
                }
            };
            for m in &mismatches {
                warn!(
                    target: "bkt::gc",
                    dev = device.idx().0,
                    bucket = m.bucket.0,
                    live = ?m.live,
                    rebuilt = ?m.rebuilt,
                    "gc_mark_mismatch"
                );
            }
            report.buckets_mismatched += mismatches.len();
        }
        report.usage_mismatches = self.usage.replace(&totals, &marks);
        info!(
            target: "bkt::gc",
            devices = devices.len(),
            buckets_mismatched = report.buckets_mismatched,
            usage_mismatches = report.usage_mismatches.len(),
            "gc_publish"
        );
        Ok(report)
    }

    /// Drop all gc epochs without publishing.
    pub fn abort_gc(&self, gc: &GcGuard<'_>) {
        let _marks = self.locks.write_marks();
        for device in self.devices() {
            device.buckets().abort_gc(gc);
        }
        *self.gc.lock() = GcState::default();
    }
}
