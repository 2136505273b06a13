//! Disk reservations: admission control against free space.
//!
//! A cached `sectors_available` counter serves most reservations with one
//! atomic subtraction. When it runs dry the slow path recomputes free space
//! from a consistent usage read under a short mutex. The cached value is
//! always computed through [`avail_factor`], so the fast path never hands
//! out the headroom kept for gc and metadata writes.
//!
//! # Logging
//!
//! - **TRACE** `bkt::reserve`: `reserve_fast` (served from the cached counter)
//! - **DEBUG** `bkt::reserve`: `reserve_grant`, `reserve_denied`, `reservation_implicit_release`
//! - **INFO** `bkt::reserve`: `capacity_set`
//! - **WARN** `bkt::reserve`: `reserve_nofail_overcommit`
//! - **ERROR** `bkt::reserve`: `online_reserved_negative`

use crate::fs::FsUsageAccumulator;
use bkt_error::{Result, SpaceError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

/// `free * 2^shift / (2^shift + 1)`: the share of free space that may be
/// reserved.
#[must_use]
pub fn avail_factor(free: u64, shift: u32) -> u64 {
    let scaled = u128::from(free) << shift;
    let divisor = (1_u128 << shift) + 1;
    u64::try_from(scaled / divisor).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReserveMode {
    #[default]
    Normal,
    /// Always succeeds, dipping into the headroom. For gc and metadata
    /// paths that must make progress on a full filesystem.
    NoFail,
}

pub struct ReservationPool {
    usage: Arc<FsUsageAccumulator>,
    capacity: AtomicU64,
    shift: u32,
    sectors_available: AtomicU64,
    recalc_lock: Mutex<()>,
    read_only: AtomicBool,
    grants: AtomicU64,
    denials: AtomicU64,
}

impl fmt::Debug for ReservationPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationPool")
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .field("sectors_available", &self.sectors_available.load(Ordering::Relaxed))
            .field("online_reserved", &self.usage.online_reserved())
            .field("read_only", &self.read_only.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ReservationPool {
    #[must_use]
    pub fn new(usage: Arc<FsUsageAccumulator>, shift: u32) -> Self {
        Self {
            usage,
            capacity: AtomicU64::new(0),
            shift,
            sectors_available: AtomicU64::new(0),
            recalc_lock: Mutex::new(()),
            read_only: AtomicBool::new(false),
            grants: AtomicU64::new(0),
            denials: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// New capacity after a device change. The cached counter is dropped
    /// so the next reservation recomputes against it.
    pub fn set_capacity(&self, capacity: u64) {
        let _recalc = self.recalc_lock.lock();
        let old = self.capacity.swap(capacity, Ordering::AcqRel);
        self.sectors_available.store(0, Ordering::Release);
        info!(target: "bkt::reserve", old, capacity, "capacity_set");
    }

    /// Latch read-only. Returns `true` for the call that flipped it.
    pub fn set_read_only(&self) -> bool {
        !self.read_only.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.grants.load(Ordering::Relaxed),
            self.denials.load(Ordering::Relaxed),
        )
    }

    /// Sectors currently reservable, recomputed from usage.
    pub fn available(&self) -> Result<u64> {
        let online = self.usage.online_reserved();
        if online < 0 {
            error!(target: "bkt::reserve", online_reserved = online, "online_reserved_negative");
            return Err(SpaceError::CorruptUsageState(format!(
                "online_reserved is negative ({online})"
            )));
        }
        let usage = self.usage.read_consistent();
        let short = usage.short(self.capacity(), self.shift);
        Ok(avail_factor(short.free, self.shift))
    }

    /// Reserve `sectors` for each of `nr_replicas` copies.
    pub fn acquire(self: &Arc<Self>, sectors: u64, nr_replicas: u32, mode: ReserveMode) -> Result<DiskReservation> {
        let need = sectors.saturating_mul(u64::from(nr_replicas.max(1)));
        self.charge(need, mode)?;
        Ok(DiskReservation {
            pool: Arc::clone(self),
            sectors: need,
            nr_replicas: nr_replicas.max(1),
        })
    }

    fn charge(&self, need: u64, mode: ReserveMode) -> Result<()> {
        if self.is_read_only() {
            return Err(SpaceError::ReadOnly);
        }
        if need == 0 {
            return Ok(());
        }

        // Counted before the cached counter is touched, so a concurrent
        // recomputation over-counts rather than under-counts.
        self.usage.add_online_u64(need, 1);
        if self
            .sectors_available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |a| a.checked_sub(need))
            .is_ok()
        {
            self.grants.fetch_add(1, Ordering::Relaxed);
            trace!(target: "bkt::reserve", sectors = need, "reserve_fast");
            return Ok(());
        }
        self.usage.add_online_u64(need, -1);

        let _recalc = self.recalc_lock.lock();
        let available = self.available()?;
        if need <= available {
            self.sectors_available.store(available - need, Ordering::Release);
        } else if mode == ReserveMode::NoFail {
            self.sectors_available.store(0, Ordering::Release);
            warn!(
                target: "bkt::reserve",
                sectors = need,
                available,
                "reserve_nofail_overcommit"
            );
        } else {
            self.sectors_available.store(available, Ordering::Release);
            self.denials.fetch_add(1, Ordering::Relaxed);
            debug!(target: "bkt::reserve", sectors = need, available, "reserve_denied");
            return Err(SpaceError::InsufficientSpace {
                requested: need,
                available,
            });
        }
        self.usage.add_online_u64(need, 1);
        self.grants.fetch_add(1, Ordering::Relaxed);
        debug!(target: "bkt::reserve", sectors = need, available, ?mode, "reserve_grant");
        Ok(())
    }

    fn uncharge(&self, sectors: u64) {
        if sectors > 0 {
            self.usage.add_online_u64(sectors, -1);
        }
    }
}

/// Sectors provisionally held against free space.
///
/// Not `Clone`: exactly one owner releases it, either by [`release`], by
/// consuming it at commit, or on drop.
///
/// [`release`]: DiskReservation::release
pub struct DiskReservation {
    pool: Arc<ReservationPool>,
    sectors: u64,
    nr_replicas: u32,
}

impl fmt::Debug for DiskReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskReservation")
            .field("sectors", &self.sectors)
            .field("nr_replicas", &self.nr_replicas)
            .finish_non_exhaustive()
    }
}

impl DiskReservation {
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    #[must_use]
    pub fn nr_replicas(&self) -> u32 {
        self.nr_replicas
    }

    /// Grow the reservation by `sectors` per replica.
    pub fn add(&mut self, sectors: u64, mode: ReserveMode) -> Result<()> {
        let need = sectors.saturating_mul(u64::from(self.nr_replicas));
        self.pool.charge(need, mode)?;
        self.sectors += need;
        Ok(())
    }

    /// Convert `added` sectors of committed growth from reserved to real
    /// usage. Returns the part of `added` the reservation did not cover.
    pub fn consume(&mut self, added: u64) -> u64 {
        let taken = added.min(self.sectors);
        self.sectors -= taken;
        self.pool.uncharge(taken);
        added - taken
    }

    /// Return whatever is left to the pool.
    pub fn release(mut self) {
        let sectors = std::mem::take(&mut self.sectors);
        self.pool.uncharge(sectors);
    }
}

impl Drop for DiskReservation {
    fn drop(&mut self) {
        if self.sectors > 0 {
            debug!(
                target: "bkt::reserve",
                sectors = self.sectors,
                "reservation_implicit_release"
            );
            let sectors = std::mem::take(&mut self.sectors);
            self.pool.uncharge(sectors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn pool(capacity: u64) -> Arc<ReservationPool> {
        let pool = Arc::new(ReservationPool::new(Arc::new(FsUsageAccumulator::new(4)), 6));
        pool.set_capacity(capacity);
        pool
    }

    #[test]
    fn avail_factor_keeps_one_sixty_fifth() {
        assert_eq!(avail_factor(800, 6), 787);
        assert_eq!(avail_factor(65, 6), 64);
        assert_eq!(avail_factor(0, 6), 0);
        assert_eq!(avail_factor(6500, 6), 6400);
    }

    #[test]
    fn acquire_then_release_leaves_online_unchanged() {
        let pool = pool(800);
        let before = pool.usage.online_reserved();
        let res = pool.acquire(100, 2, ReserveMode::Normal).expect("fits");
        assert_eq!(res.sectors(), 200);
        assert_eq!(pool.usage.online_reserved(), before + 200);
        res.release();
        assert_eq!(pool.usage.online_reserved(), before);
    }

    #[test]
    fn drop_releases_remaining_sectors() {
        let pool = pool(800);
        {
            let _res = pool.acquire(50, 1, ReserveMode::Normal).expect("fits");
            assert_eq!(pool.usage.online_reserved(), 50);
        }
        assert_eq!(pool.usage.online_reserved(), 0);
    }

    #[test]
    fn headroom_is_only_for_nofail() {
        let pool = pool(800);
        let err = pool.acquire(790, 1, ReserveMode::Normal).expect_err("into headroom");
        assert_eq!(
            err,
            SpaceError::InsufficientSpace {
                requested: 790,
                available: 787
            }
        );
        let res = pool.acquire(790, 1, ReserveMode::NoFail).expect("nofail");
        assert_eq!(res.sectors(), 790);
        assert_eq!(pool.stats(), (1, 1));
    }

    #[test]
    fn consume_reports_overrun() {
        let pool = pool(800);
        let mut res = pool.acquire(10, 1, ReserveMode::Normal).expect("fits");
        assert_eq!(res.consume(4), 0);
        assert_eq!(res.sectors(), 6);
        assert_eq!(res.consume(9), 3);
        assert_eq!(res.sectors(), 0);
        assert_eq!(pool.usage.online_reserved(), 0);
    }

    #[test]
    fn add_grows_reservation() {
        let pool = pool(800);
        let mut res = pool.acquire(10, 2, ReserveMode::Normal).expect("fits");
        res.add(5, ReserveMode::Normal).expect("fits");
        assert_eq!(res.sectors(), 30);
        assert_eq!(pool.usage.online_reserved(), 30);
    }

    #[test]
    fn read_only_refuses_reservations() {
        let pool = pool(800);
        assert!(pool.set_read_only());
        assert!(!pool.set_read_only());
        assert_eq!(
            pool.acquire(1, 1, ReserveMode::NoFail).expect_err("ro"),
            SpaceError::ReadOnly
        );
    }

    #[test]
    fn concurrent_acquire_never_oversubscribes() {
        let pool = pool(6500);
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut held = Vec::new();
                    while let Ok(res) = pool.acquire(10, 1, ReserveMode::Normal) {
                        held.push(res);
                    }
                    held
                })
            })
            .collect();
        let held: Vec<DiskReservation> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join"))
            .collect();
        let total: u64 = held.iter().map(DiskReservation::sectors).sum();
        assert!(total <= avail_factor(6500, 6), "reserved {total}");
        assert_eq!(pool.usage.online_reserved_u64(), total);
        drop(held);
        assert_eq!(pool.usage.online_reserved(), 0);
    }
}
