#![forbid(unsafe_code)]
//! Usage accounting for buckets and disk reservations.
//!
//! - [`DeviceUsageAccumulator`]: per-device bucket histogram and sector totals.
//! - [`FsUsageAccumulator`]: filesystem totals with one counter per replicas
//!   entry, readable consistently while the entry set grows.
//! - [`ReservationPool`] / [`DiskReservation`]: admission control for writes.
//!
//! Every accumulator adds into per-thread shards without locking and folds
//! into a base on demand. See [`shard`] for the fold protocol.

mod device;
mod fs;
mod replicas;
mod reserve;
pub mod shard;

pub use device::{DevTypeUsage, DevUsage, DevUsageDelta, DeviceUsageAccumulator};
pub use fs::{
    FsUsage, FsUsageAccumulator, FsUsageDelta, FsUsageShort, ReplicasUsage, UsageMismatch,
    reserve_factor,
};
pub use replicas::ReplicasTable;
pub use reserve::{DiskReservation, ReservationPool, ReserveMode, avail_factor};
pub use shard::default_shard_count;
