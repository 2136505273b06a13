//! Filesystem-scope usage with a variable-length replicas section.
//!
//! The counter layout (fixed header followed by one counter per replicas
//! entry) lives behind an [`ArcSwap`]. Adding an entry builds a new layout
//! with the old totals folded into its base, and only happens under the
//! exclusive mark lock; adds require the shared mark lock, so no add can
//! land in a retired layout. Readers hold no lock at all and instead retry
//! when the layout sequence moved underneath them.
//!
//! # Logging
//!
//! - **TRACE** `bkt::usage`: `fs_usage_read_retry` (layout changed during a read)
//! - **INFO** `bkt::usage`: `replicas_layout_grow` (new replicas entries added)
//! - **WARN** `bkt::usage`: `fs_usage_mismatch` (a rebuilt total differs from the accumulated one)

use crate::replicas::ReplicasTable;
use crate::shard::Accumulator;
use arc_swap::ArcSwap;
use bkt_buckets::{MarkReadGuard, MarkWriteGuard};
use bkt_error::{Result, SpaceError};
use bkt_types::{DataType, REPLICAS_MAX, ReplicasEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, trace, warn};

const HIDDEN: usize = 0;
const BTREE: usize = 1;
const DATA: usize = 2;
const CACHED: usize = 3;
const RESERVED: usize = 4;
const NR_INODES: usize = 5;
const PERSISTENT_RESERVED: usize = 6;
const HEADER: usize = PERSISTENT_RESERVED + REPLICAS_MAX;

const HEADER_NAMES: [&str; HEADER] = [
    "hidden",
    "btree",
    "data",
    "cached",
    "reserved",
    "nr_inodes",
    "persistent_reserved[0]",
    "persistent_reserved[1]",
    "persistent_reserved[2]",
    "persistent_reserved[3]",
];

fn header_slot(data_type: DataType) -> Option<usize> {
    match data_type {
        DataType::None => None,
        DataType::Superblock | DataType::Journal => Some(HIDDEN),
        DataType::Btree => Some(BTREE),
        DataType::User | DataType::Parity => Some(DATA),
        DataType::Cached => Some(CACHED),
    }
}

/// `r + ceil(r / 2^shift)`: reserved sectors are charged with headroom for
/// the metadata that will describe them.
#[must_use]
pub fn reserve_factor(r: u64, shift: u32) -> u64 {
    r.saturating_add(r.div_ceil(1_u64 << shift))
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

// ── Deltas ──────────────────────────────────────────────────────────────────

/// Signed change to filesystem usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsUsageDelta {
    header: [i64; HEADER],
    replicas: Vec<(ReplicasEntry, i64)>,
}

impl FsUsageDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sectors for one replicas entry; the header total for its data type
    /// moves with it.
    pub fn add_replicas(&mut self, entry: &ReplicasEntry, sectors: i64) {
        if sectors == 0 {
            return;
        }
        if let Some(slot) = header_slot(entry.data_type) {
            self.header[slot] += sectors;
        }
        match self.replicas.iter_mut().find(|(e, _)| e == entry) {
            Some((_, s)) => *s += sectors,
            None => self.replicas.push((entry.clone(), sectors)),
        }
    }

    /// Persistent reservation of `sectors` per replica, `nr_replicas` copies.
    pub fn add_reserved(&mut self, nr_replicas: u8, sectors: i64) {
        let nr = usize::from(nr_replicas).clamp(1, REPLICAS_MAX);
        self.header[RESERVED] += sectors * i64::from(nr_replicas.max(1));
        self.header[PERSISTENT_RESERVED + nr - 1] += sectors;
    }

    pub fn add_inodes(&mut self, nr: i64) {
        self.header[NR_INODES] += nr;
    }

    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.header.iter_mut().zip(other.header) {
            *a += b;
        }
        for (entry, sectors) in &other.replicas {
            match self.replicas.iter_mut().find(|(e, _)| e == entry) {
                Some((_, s)) => *s += sectors,
                None => self.replicas.push((entry.clone(), *sectors)),
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.iter().all(|&v| v == 0) && self.replicas.iter().all(|(_, s)| *s == 0)
    }

    /// Growth that must be backed by a disk reservation: btree, data and
    /// reserved sectors. Cached and fixed metadata sectors are free.
    #[must_use]
    pub fn sectors_added(&self) -> i64 {
        self.header[BTREE] + self.header[DATA] + self.header[RESERVED]
    }

    #[must_use]
    pub fn replicas_sectors(&self, entry: &ReplicasEntry) -> i64 {
        self.replicas
            .iter()
            .find(|(e, _)| e == entry)
            .map_or(0, |(_, s)| *s)
    }

    pub fn replicas(&self) -> impl Iterator<Item = (&ReplicasEntry, i64)> {
        self.replicas.iter().map(|(e, s)| (e, *s))
    }

    #[must_use]
    pub fn btree(&self) -> i64 {
        self.header[BTREE]
    }

    #[must_use]
    pub fn data(&self) -> i64 {
        self.header[DATA]
    }

    #[must_use]
    pub fn cached(&self) -> i64 {
        self.header[CACHED]
    }

    #[must_use]
    pub fn hidden(&self) -> i64 {
        self.header[HIDDEN]
    }

    #[must_use]
    pub fn reserved(&self) -> i64 {
        self.header[RESERVED]
    }

    #[must_use]
    pub fn nr_inodes(&self) -> i64 {
        self.header[NR_INODES]
    }
}

// ── Snapshots ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasUsage {
    pub entry: ReplicasEntry,
    pub sectors: u64,
}

/// Consistent filesystem usage, as handed to the superblock writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsage {
    /// Layout sequence this snapshot was read under.
    pub seq: u64,
    pub hidden: u64,
    pub btree: u64,
    pub data: u64,
    pub cached: u64,
    pub reserved: u64,
    pub nr_inodes: u64,
    pub persistent_reserved: [u64; REPLICAS_MAX],
    pub online_reserved: u64,
    pub replicas: Vec<ReplicasUsage>,
}

impl FsUsage {
    #[must_use]
    pub fn replicas_sectors(&self, entry: &ReplicasEntry) -> u64 {
        self.replicas
            .iter()
            .find(|r| &r.entry == entry)
            .map_or(0, |r| r.sectors)
    }

    /// `hidden + btree + data + reserve_factor(reserved + online_reserved)`,
    /// clamped to `capacity`.
    #[must_use]
    pub fn sectors_used(&self, capacity: u64, shift: u32) -> u64 {
        let reserved = reserve_factor(self.reserved.saturating_add(self.online_reserved), shift);
        self.hidden
            .saturating_add(self.btree)
            .saturating_add(self.data)
            .saturating_add(reserved)
            .min(capacity)
    }

    #[must_use]
    pub fn short(&self, capacity: u64, shift: u32) -> FsUsageShort {
        let used = self.sectors_used(capacity, shift);
        FsUsageShort {
            capacity,
            used,
            free: capacity - used,
            nr_inodes: self.nr_inodes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsageShort {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub nr_inodes: u64,
}

/// A counter whose rebuilt value disagreed with the accumulated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageMismatch {
    pub counter: String,
    pub accumulated: i64,
    pub rebuilt: i64,
}

// ── Accumulator ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Layout {
    seq: u64,
    table: ReplicasTable,
    counters: Accumulator,
}

impl Layout {
    fn dense(&self, delta: &FsUsageDelta) -> Result<Vec<i64>> {
        let mut dense = vec![0; HEADER + self.table.len()];
        dense[..HEADER].copy_from_slice(&delta.header);
        for (entry, sectors) in &delta.replicas {
            let idx = self.table.position(entry).ok_or_else(|| {
                SpaceError::conflict(format!("replicas entry {entry} missing from layout {}", self.seq))
            })?;
            dense[HEADER + idx] += sectors;
        }
        Ok(dense)
    }
}

#[derive(Debug)]
pub struct FsUsageAccumulator {
    shard_count: usize,
    layout: ArcSwap<Layout>,
    online: Accumulator,
    read_retries: AtomicU64,
}

impl FsUsageAccumulator {
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count,
            layout: ArcSwap::from_pointee(Layout {
                seq: 0,
                table: ReplicasTable::new(),
                counters: Accumulator::new(shard_count, HEADER),
            }),
            online: Accumulator::new(shard_count, 1),
            read_retries: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn layout_seq(&self) -> u64 {
        self.layout.load().seq
    }

    #[must_use]
    pub fn nr_replicas_entries(&self) -> usize {
        self.layout.load().table.len()
    }

    #[must_use]
    pub fn has_entry(&self, entry: &ReplicasEntry) -> bool {
        self.layout.load().table.contains(entry)
    }

    /// Entries of `delta` the current layout has no counter for.
    #[must_use]
    pub fn missing_entries(&self, delta: &FsUsageDelta) -> Vec<ReplicasEntry> {
        let layout = self.layout.load();
        delta
            .replicas
            .iter()
            .filter(|(e, s)| *s != 0 && !layout.table.contains(e))
            .map(|(e, _)| e.clone())
            .collect()
    }

    /// Grow the layout to cover `entries`. Returns how many were added.
    pub fn ensure_entries<'e>(
        &self,
        entries: impl IntoIterator<Item = &'e ReplicasEntry>,
        _marks: &MarkWriteGuard<'_>,
    ) -> usize {
        let current = self.layout.load_full();
        let missing: Vec<&ReplicasEntry> = entries
            .into_iter()
            .filter(|e| !current.table.contains(e))
            .collect();
        if missing.is_empty() {
            return 0;
        }
        let mut table = current.table.clone();
        for entry in &missing {
            table.insert((*entry).clone());
        }
        let mut base = current.counters.fold_and_read();
        base.resize(HEADER + table.len(), 0);
        let next = Layout {
            seq: current.seq + 1,
            table,
            counters: Accumulator::with_base(self.shard_count, base),
        };
        info!(
            target: "bkt::usage",
            seq = next.seq,
            added = missing.len(),
            entries = next.table.len(),
            "replicas_layout_grow"
        );
        self.layout.store(Arc::new(next));
        missing.len()
    }

    /// Lock-free add of a whole delta. Fails with `ConflictingUpdate` if the
    /// delta names an entry the layout lacks; the caller grows the layout
    /// and retries.
    pub fn add(&self, delta: &FsUsageDelta, _marks: &MarkReadGuard<'_>) -> Result<()> {
        let layout = self.layout.load();
        let dense = layout.dense(delta)?;
        layout.counters.add_dense(&dense);
        Ok(())
    }

    /// Add while holding the exclusive mark lock, growing the layout first
    /// if `delta` names entries it lacks.
    pub fn add_exclusive(&self, delta: &FsUsageDelta, marks: &MarkWriteGuard<'_>) -> Result<()> {
        self.ensure_entries(delta.replicas.iter().map(|(e, _)| e), marks);
        let layout = self.layout.load();
        let dense = layout.dense(delta)?;
        layout.counters.add_dense(&dense);
        Ok(())
    }

    pub fn add_online(&self, sectors: i64) {
        self.online.add(0, sectors);
    }

    /// Raw online-reserved total; negative means a release without a
    /// matching acquisition.
    #[must_use]
    pub fn online_reserved(&self) -> i64 {
        self.online.read_one(0)
    }

    pub fn fold(&self) {
        self.layout.load().counters.fold();
        self.online.fold();
    }

    #[must_use]
    pub fn read_retries(&self) -> u64 {
        self.read_retries.load(Ordering::Relaxed)
    }

    /// Sum every shard into a snapshot whose replicas section matches one
    /// single layout.
    #[must_use]
    pub fn read_consistent(&self) -> FsUsage {
        loop {
            let layout = self.layout.load_full();
            let seq = layout.seq;
            let raw = layout.counters.read();
            if self.layout.load().seq != seq {
                self.read_retries.fetch_add(1, Ordering::Relaxed);
                trace!(target: "bkt::usage", seq, "fs_usage_read_retry");
                continue;
            }
            return self.decode(&layout, &raw);
        }
    }

    fn decode(&self, layout: &Layout, raw: &[i64]) -> FsUsage {
        let get = |i: usize| to_u64(raw.get(i).copied().unwrap_or(0));
        let mut persistent_reserved = [0; REPLICAS_MAX];
        for (i, slot) in persistent_reserved.iter_mut().enumerate() {
            *slot = get(PERSISTENT_RESERVED + i);
        }
        FsUsage {
            seq: layout.seq,
            hidden: get(HIDDEN),
            btree: get(BTREE),
            data: get(DATA),
            cached: get(CACHED),
            reserved: get(RESERVED),
            nr_inodes: get(NR_INODES),
            persistent_reserved,
            online_reserved: to_u64(self.online_reserved()),
            replicas: layout
                .table
                .iter()
                .enumerate()
                .map(|(i, entry)| ReplicasUsage {
                    entry: entry.clone(),
                    sectors: get(HEADER + i),
                })
                .collect(),
        }
    }

    /// Install totals rebuilt from scratch (by gc) in place of the
    /// accumulated ones. Returns every counter that disagreed.
    pub fn replace(&self, totals: &FsUsageDelta, marks: &MarkWriteGuard<'_>) -> Vec<UsageMismatch> {
        self.ensure_entries(totals.replicas.iter().map(|(e, _)| e), marks);
        let layout = self.layout.load_full();
        let accumulated = layout.counters.fold_and_read();
        let rebuilt = match layout.dense(totals) {
            Ok(dense) => dense,
            Err(_) => return Vec::new(),
        };

        let mut mismatches = Vec::new();
        for (i, (&acc, &new)) in accumulated.iter().zip(&rebuilt).enumerate() {
            if acc == new {
                continue;
            }
            let counter = HEADER_NAMES.get(i).map_or_else(
                || {
                    layout
                        .table
                        .iter()
                        .nth(i - HEADER)
                        .map_or_else(|| format!("replicas[{}]", i - HEADER), ToString::to_string)
                },
                |name| (*name).to_owned(),
            );
            warn!(
                target: "bkt::usage",
                counter = counter.as_str(),
                accumulated = acc,
                rebuilt = new,
                "fs_usage_mismatch"
            );
            mismatches.push(UsageMismatch {
                counter,
                accumulated: acc,
                rebuilt: new,
            });
        }
        layout.counters.replace(&rebuilt);
        mismatches
    }

    #[must_use]
    pub fn online_reserved_u64(&self) -> u64 {
        to_u64(self.online_reserved())
    }

    pub(crate) fn add_online_u64(&self, sectors: u64, sign: i64) {
        self.add_online(sign * to_i64(sectors));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bkt_buckets::MarkLocks;
    use bkt_types::DeviceIdx;
    use std::sync::Barrier;
    use std::thread;

    fn user(devs: &[u32]) -> ReplicasEntry {
        ReplicasEntry::new(
            DataType::User,
            1,
            devs.iter().copied().map(DeviceIdx).collect(),
        )
    }

    #[test]
    fn add_requires_known_entry() {
        let locks = MarkLocks::new();
        let usage = FsUsageAccumulator::new(2);
        let mut delta = FsUsageDelta::new();
        delta.add_replicas(&user(&[0]), 8);

        let err = usage.add(&delta, &locks.read_marks()).expect_err("unknown entry");
        assert!(err.is_retryable());

        assert_eq!(usage.missing_entries(&delta), vec![user(&[0])]);
        assert_eq!(usage.ensure_entries(usage.missing_entries(&delta).iter(), &locks.write_marks()), 1);
        usage.add(&delta, &locks.read_marks()).expect("known entry");

        let snap = usage.read_consistent();
        assert_eq!(snap.data, 8);
        assert_eq!(snap.replicas_sectors(&user(&[0])), 8);
        assert_eq!(snap.seq, 1);
    }

    #[test]
    fn exclusive_add_grows_layout() {
        let locks = MarkLocks::new();
        let usage = FsUsageAccumulator::new(2);
        let entry = ReplicasEntry::single(DataType::Cached, DeviceIdx(1));
        let mut delta = FsUsageDelta::new();
        delta.add_replicas(&entry, 5);
        usage.add_exclusive(&delta, &locks.write_marks()).expect("add");
        let snap = usage.read_consistent();
        assert_eq!(snap.cached, 5);
        assert_eq!(snap.replicas_sectors(&entry), 5);
    }

    #[test]
    fn layout_growth_keeps_totals() {
        let locks = MarkLocks::new();
        let usage = FsUsageAccumulator::new(4);
        let a = user(&[0]);
        let b = user(&[0, 1]);
        usage.ensure_entries([&a], &locks.write_marks());
        let mut delta = FsUsageDelta::new();
        delta.add_replicas(&a, 16);
        usage.add(&delta, &locks.read_marks()).expect("add");

        usage.ensure_entries([&b], &locks.write_marks());
        let mut more = FsUsageDelta::new();
        more.add_replicas(&b, 4);
        usage.add(&more, &locks.read_marks()).expect("add");

        let snap = usage.read_consistent();
        assert_eq!(snap.replicas_sectors(&a), 16);
        assert_eq!(snap.replicas_sectors(&b), 4);
        assert_eq!(snap.data, 20);
    }

    #[test]
    fn concurrent_adds_of_same_entry() {
        let locks = Arc::new(MarkLocks::new());
        let usage = Arc::new(FsUsageAccumulator::new(4));
        let entry = user(&[2]);
        usage.ensure_entries([&entry], &locks.write_marks());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (locks, usage, barrier, entry) =
                    (Arc::clone(&locks), Arc::clone(&usage), Arc::clone(&barrier), entry.clone());
                thread::spawn(move || {
                    barrier.wait();
                    let mut delta = FsUsageDelta::new();
                    delta.add_replicas(&entry, 10);
                    usage.add(&delta, &locks.read_marks()).expect("add");
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(usage.read_consistent().replicas_sectors(&entry), 40);
    }

    #[test]
    fn sectors_used_applies_reserve_factor_and_clamps() {
        let usage = FsUsage {
            btree: 100,
            data: 200,
            reserved: 64,
            online_reserved: 64,
            ..FsUsage::default()
        };
        // 128 reserved -> 128 + 2
        assert_eq!(usage.sectors_used(10_000, 6), 430);
        assert_eq!(usage.sectors_used(300, 6), 300);
        let short = usage.short(1000, 6);
        assert_eq!(short.free, 570);
    }

    #[test]
    fn reservation_keys_feed_persistent_reserved() {
        let mut delta = FsUsageDelta::new();
        delta.add_reserved(2, 8);
        assert_eq!(delta.reserved(), 16);
        assert_eq!(delta.sectors_added(), 16);
        let locks = MarkLocks::new();
        let usage = FsUsageAccumulator::new(1);
        usage.add(&delta, &locks.read_marks()).expect("header only");
        let snap = usage.read_consistent();
        assert_eq!(snap.persistent_reserved, [0, 8, 0, 0]);
    }

    #[test]
    fn replace_reports_mismatches() {
        let locks = MarkLocks::new();
        let usage = FsUsageAccumulator::new(2);
        let entry = ReplicasEntry::single(DataType::Btree, DeviceIdx(0));
        usage.ensure_entries([&entry], &locks.write_marks());
        let mut delta = FsUsageDelta::new();
        delta.add_replicas(&entry, 12);
        usage.add(&delta, &locks.read_marks()).expect("add");

        let mut rebuilt = FsUsageDelta::new();
        rebuilt.add_replicas(&entry, 8);
        let mismatches = usage.replace(&rebuilt, &locks.write_marks());
        let names: Vec<&str> = mismatches.iter().map(|m| m.counter.as_str()).collect();
        assert_eq!(names, vec!["btree", "btree: 1/1 [0]"]);
        assert_eq!(usage.read_consistent().btree, 8);
    }

    #[test]
    fn snapshot_serializes_for_superblock_writer() {
        let locks = MarkLocks::new();
        let usage = FsUsageAccumulator::new(1);
        let entry = user(&[0, 1]);
        usage.ensure_entries([&entry], &locks.write_marks());
        let mut delta = FsUsageDelta::new();
        delta.add_replicas(&entry, 24);
        delta.add_inodes(3);
        usage.add(&delta, &locks.read_marks()).expect("add");

        let json = serde_json::to_value(usage.read_consistent()).expect("serialize");
        assert_eq!(json["data"], 24);
        assert_eq!(json["nr_inodes"], 3);
        assert_eq!(json["replicas"][0]["sectors"], 24);
        assert_eq!(json["replicas"][0]["entry"]["devs"], serde_json::json!([0, 1]));
    }
}
