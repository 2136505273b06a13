//! Registered devices and their fixed metadata layout.

use bkt_buckets::{DeviceBuckets, FsId, MarkAccess, MarkLocks, MarkUpdate, MarkView};
use bkt_error::{Result, SpaceError};
use bkt_types::{BucketIdx, BucketMark, DataType, DeviceGeometry, DeviceIdx, MemberInfo};
use bkt_usage::{DevUsage, DevUsageDelta, DeviceUsageAccumulator};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    ReadWrite,
    ReadOnly,
    Failed,
    Spare,
}

impl DeviceState {
    /// Only read-write devices take new allocations and count toward
    /// capacity.
    #[must_use]
    pub fn allocates(self) -> bool {
        self == Self::ReadWrite
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadWrite => "rw",
            Self::ReadOnly => "ro",
            Self::Failed => "failed",
            Self::Spare => "spare",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sectors of one bucket taken by superblock or journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMark {
    pub bucket: BucketIdx,
    pub data_type: DataType,
    pub sectors: u32,
}

fn push_metadata(out: &mut Vec<MetadataMark>, bucket: BucketIdx, data_type: DataType, sectors: u32) {
    match out
        .iter_mut()
        .find(|m| m.bucket == bucket && m.data_type == data_type)
    {
        Some(m) => m.sectors = m.sectors.saturating_add(sectors),
        None => out.push(MetadataMark {
            bucket,
            data_type,
            sectors,
        }),
    }
}

/// Where the superblock copies and journal sit on a device, bucket by
/// bucket. A superblock copy straddling a bucket boundary is split.
#[must_use]
pub fn metadata_layout(member: &MemberInfo) -> Vec<MetadataMark> {
    let geo = member.geometry;
    let bucket_size = u64::from(geo.bucket_size);
    let mut out = Vec::new();
    for &offset in &member.superblock_offsets {
        let end = offset.saturating_add(u64::from(member.superblock_sectors));
        let mut start = offset;
        while start < end {
            let bucket = geo.sector_to_bucket(start);
            let bucket_end = geo.bucket_to_sector(bucket).saturating_add(bucket_size);
            let n = end.min(bucket_end) - start;
            push_metadata(
                &mut out,
                bucket,
                DataType::Superblock,
                u32::try_from(n).unwrap_or(geo.bucket_size),
            );
            start += n;
        }
    }
    for &bucket in &member.journal_buckets {
        push_metadata(&mut out, BucketIdx(bucket), DataType::Journal, geo.bucket_size);
    }
    out
}

/// One member device: its bucket arrays and usage counters.
pub struct Device {
    idx: DeviceIdx,
    fs: FsId,
    member: RwLock<MemberInfo>,
    state: RwLock<DeviceState>,
    buckets: DeviceBuckets,
    usage: DeviceUsageAccumulator,
    /// Every superblock and journal mark applied so far, the member info
    /// layout included. The gc scan rebuilds fixed metadata from this.
    metadata: Mutex<Vec<MetadataMark>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("idx", &self.idx)
            .field("state", &*self.state.read())
            .field("geometry", &self.geometry())
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn new(
        locks: &MarkLocks,
        idx: DeviceIdx,
        member: MemberInfo,
        state: DeviceState,
        shard_count: usize,
    ) -> Result<Self> {
        member
            .validate()
            .map_err(|e| SpaceError::InvalidGeometry(e.to_string()))?;
        let geometry = member.geometry;
        Ok(Self {
            idx,
            fs: locks.fs_id(),
            buckets: DeviceBuckets::new(locks, idx, geometry)?,
            usage: DeviceUsageAccumulator::new(shard_count, geometry),
            member: RwLock::new(member),
            state: RwLock::new(state),
            metadata: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn idx(&self) -> DeviceIdx {
        self.idx
    }

    #[must_use]
    pub fn member(&self) -> MemberInfo {
        self.member.read().clone()
    }

    #[must_use]
    pub fn geometry(&self) -> DeviceGeometry {
        self.member.read().geometry
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: DeviceState) -> DeviceState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    pub(crate) fn set_member(&self, member: MemberInfo) {
        *self.member.write() = member;
    }

    /// Fixed metadata marked on this device, bucket by bucket.
    #[must_use]
    pub fn metadata_marks(&self) -> Vec<MetadataMark> {
        self.metadata.lock().clone()
    }

    pub(crate) fn record_metadata(&self, bucket: BucketIdx, data_type: DataType, sectors: u32) {
        push_metadata(&mut self.metadata.lock(), bucket, data_type, sectors);
    }

    /// Forget metadata in buckets a shrink dropped.
    pub(crate) fn truncate_metadata(&self, nbuckets: u64) {
        self.metadata.lock().retain(|m| m.bucket.0 < nbuckets);
    }

    #[must_use]
    pub fn buckets(&self) -> &DeviceBuckets {
        &self.buckets
    }

    #[must_use]
    pub fn usage(&self) -> DevUsage {
        self.usage.read()
    }

    pub(crate) fn fold(&self) {
        self.usage.fold();
    }

    /// Compare-exchange the mark of `bucket` in `view`. Live transitions of
    /// usable buckets are accounted in device usage; gc-epoch usage is
    /// recounted when the epoch is published.
    ///
    /// `held` must be a mark-lock guard for live updates, so a gc publish
    /// cannot recount between the exchange and the accounting.
    pub fn update_mark<F>(&self, bucket: BucketIdx, view: MarkView<'_>, held: &dyn MarkAccess, f: F) -> Result<MarkUpdate>
    where
        F: FnMut(BucketMark) -> Result<BucketMark>,
    {
        debug_assert!(held.covers(self.fs, self.idx));
        let update = self.buckets.cas_mark(bucket, view, f)?;
        if update.changed() && matches!(view, MarkView::Live) {
            let geometry = self.buckets.geometry();
            if geometry.contains(bucket) {
                self.usage.add(&DevUsageDelta::from_marks(
                    update.old,
                    update.new,
                    geometry.bucket_size,
                ));
            }
        }
        Ok(update)
    }

    /// Recount device usage from the live marks.
    pub(crate) fn rebuild_usage(&self) -> Result<DevUsage> {
        let live = self.buckets.live_array()?;
        Ok(self
            .usage
            .rebuild(live.geometry(), live.iter_usable().map(|(_, b)| b.mark())))
    }
}
