//! Human-readable and serializable usage reports.

use crate::device::DeviceState;
use bkt_alloc::FreelistStats;
use bkt_types::{DataType, DeviceIdx};
use bkt_usage::{DevUsage, FsUsage, FsUsageShort};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time space accounting for the superblock and journal writers,
/// and for tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSnapshot {
    pub short: FsUsageShort,
    pub fs: FsUsage,
    pub devices: Vec<DeviceSnapshot>,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub dev: DeviceIdx,
    pub state: DeviceState,
    pub usage: DevUsage,
    pub freelist: FreelistStats,
}

struct FsUsageText<'a> {
    usage: &'a FsUsage,
    short: &'a FsUsageShort,
}

impl fmt::Display for FsUsageText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let u = self.usage;
        writeln!(f, "{:<24}{}", "capacity:", self.short.capacity)?;
        writeln!(f, "{:<24}{}", "used:", self.short.used)?;
        writeln!(f, "{:<24}{}", "free:", self.short.free)?;
        writeln!(f, "{:<24}{}", "hidden:", u.hidden)?;
        writeln!(f, "{:<24}{}", "btree:", u.btree)?;
        writeln!(f, "{:<24}{}", "data:", u.data)?;
        writeln!(f, "{:<24}{}", "cached:", u.cached)?;
        writeln!(f, "{:<24}{}", "reserved:", u.reserved)?;
        writeln!(f, "{:<24}{}", "nr_inodes:", u.nr_inodes)?;
        writeln!(f, "{:<24}{}", "online reserved:", u.online_reserved)?;
        for (i, sectors) in u.persistent_reserved.iter().enumerate() {
            if *sectors == 0 {
                continue;
            }
            writeln!(f, "  {} replicas:", i + 1)?;
            writeln!(f, "  {:<22}{}", "reserved:", sectors)?;
        }
        for r in &u.replicas {
            writeln!(f, "{:<40}{}", r.entry.to_string(), r.sectors)?;
        }
        Ok(())
    }
}

struct DevUsageText<'a> {
    dev: DeviceIdx,
    state: DeviceState,
    usage: &'a DevUsage,
    freelist: &'a FreelistStats,
}

impl fmt::Display for DevUsageText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let u = self.usage;
        writeln!(f, "device {} ({}):", self.dev, self.state)?;
        writeln!(f, "{:<14}{:>12}{:>14}{:>14}", "", "buckets", "sectors", "fragmented")?;
        for data_type in DataType::ALL {
            let t = u.data_type(data_type);
            writeln!(
                f,
                "{:<14}{:>12}{:>14}{:>14}",
                data_type.name(),
                t.buckets,
                t.sectors,
                t.fragmented
            )?;
        }
        writeln!(f, "{:<24}{}", "ec:", u.buckets_ec)?;
        writeln!(f, "{:<24}{}", "allocator owned:", u.buckets_alloc)?;
        writeln!(f, "{:<24}{}", "unavailable:", u.buckets_unavailable)?;
        writeln!(f, "{:<24}{}", "available:", u.buckets_available())?;
        writeln!(f, "{:<24}{}", "freelist:", self.freelist.queued())?;
        writeln!(f, "{:<24}{}", "open buckets:", self.freelist.open)?;
        writeln!(f, "{:<24}{}", "bucket size:", u.bucket_size)?;
        writeln!(f, "{:<24}{}", "first bucket:", u.first_bucket)?;
        writeln!(f, "{:<24}{}", "nbuckets:", u.nbuckets)
    }
}

#[must_use]
pub fn fs_usage_to_text(usage: &FsUsage, short: &FsUsageShort) -> String {
    FsUsageText { usage, short }.to_string()
}

#[must_use]
pub fn dev_usage_to_text(dev: &DeviceSnapshot) -> String {
    DevUsageText {
        dev: dev.dev,
        state: dev.state,
        usage: &dev.usage,
        freelist: &dev.freelist,
    }
    .to_string()
}
