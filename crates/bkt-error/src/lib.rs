#![forbid(unsafe_code)]
//! Error types for bucket usage accounting.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Recovery |
//! |-------|----------|----------|
//! | Space | `InsufficientSpace`, `FreelistEmpty`, `OpenBucketsExhausted` | Returned to the caller; retry later, free space, or use the no-fail reservation mode on privileged paths |
//! | Staleness | `StaleReference` | Caller drops the pointer and re-reads the current key |
//! | Concurrency | `ConflictingUpdate` | Retried internally by the transaction layer up to its restart budget |
//! | Fatal | `CorruptUsageState` | Logged at ERROR, latches the filesystem read-only |
//! | Administrative | `InvalidGeometry`, `BucketOutOfRange`, `DeviceNotFound`, `DeviceExists`, `DeviceBusy`, `GcNotRunning`, `ReadOnly` | Returned to the caller |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`SpaceError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `InsufficientSpace` | `ENOSPC` |
//! | `FreelistEmpty` | `ENOSPC` |
//! | `OpenBucketsExhausted` | `EAGAIN` |
//! | `StaleReference` | `ESTALE` |
//! | `ConflictingUpdate` | `EAGAIN` |
//! | `CorruptUsageState` | `EIO` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `BucketOutOfRange` | `EINVAL` |
//! | `DeviceNotFound` | `ENODEV` |
//! | `DeviceExists` | `EEXIST` |
//! | `DeviceBusy` | `EBUSY` |
//! | `GcNotRunning` | `EINVAL` |
//! | `ReadOnly` | `EROFS` |
//!
//! ## Design Constraints
//!
//! - `bkt-error` MUST NOT depend on `bkt-types`; ids are carried as their raw
//!   integers so every crate can construct these errors.
//! - Geometry validation errors from `bkt-types` are converted into
//!   `InvalidGeometry` at the crate that performs the validation.

use thiserror::Error;

/// Unified error type for bucket usage accounting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpaceError {
    /// Disk reservation denied by admission control.
    #[error("insufficient space: requested {requested} sectors, {available} available")]
    InsufficientSpace { requested: u64, available: u64 },

    /// No bucket on any freelist tier the caller may draw from.
    #[error("device {dev}: freelist empty")]
    FreelistEmpty { dev: u32 },

    /// The device already has the maximum number of open buckets.
    #[error("device {dev}: open bucket limit {limit} reached")]
    OpenBucketsExhausted { dev: u32, limit: usize },

    /// A pointer's generation is behind its bucket's generation.
    ///
    /// Never fatal: the caller discards the pointer and reads the current
    /// key state.
    #[error("stale pointer into bucket {dev}:{bucket}: ptr gen {ptr_gen}, bucket gen {bucket_gen}")]
    StaleReference {
        dev: u32,
        bucket: u64,
        ptr_gen: u8,
        bucket_gen: u8,
    },

    /// Staged deltas were invalidated by a concurrent commit.
    #[error("conflicting update: {detail}")]
    ConflictingUpdate { detail: String },

    /// Usage counters disagree with a structural invariant.
    #[error("corrupt usage state: {0}")]
    CorruptUsageState(String),

    /// Member info or a resize target is not usable.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("bucket {dev}:{bucket} out of range (nbuckets {nbuckets})")]
    BucketOutOfRange { dev: u32, bucket: u64, nbuckets: u64 },

    #[error("device {dev} not found")]
    DeviceNotFound { dev: u32 },

    #[error("device {dev} already exists")]
    DeviceExists { dev: u32 },

    /// Removal, shrink, or invalidation refused because buckets are in use.
    #[error("device {dev} busy: {detail}")]
    DeviceBusy { dev: u32, detail: String },

    /// A gc-epoch access was attempted while no gc epoch exists.
    #[error("no gc epoch is active")]
    GcNotRunning,

    /// The filesystem went read-only after a fatal usage error.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl SpaceError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InsufficientSpace { .. } | Self::FreelistEmpty { .. } => libc::ENOSPC,
            Self::OpenBucketsExhausted { .. } | Self::ConflictingUpdate { .. } => libc::EAGAIN,
            Self::StaleReference { .. } => libc::ESTALE,
            Self::CorruptUsageState(_) => libc::EIO,
            Self::InvalidGeometry(_) | Self::BucketOutOfRange { .. } | Self::GcNotRunning => {
                libc::EINVAL
            }
            Self::DeviceNotFound { .. } => libc::ENODEV,
            Self::DeviceExists { .. } => libc::EEXIST,
            Self::DeviceBusy { .. } => libc::EBUSY,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Only a conflicting update is worth restarting the transaction for.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConflictingUpdate { .. })
    }

    /// Errors that mean the in-memory accounting can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptUsageState(_))
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::ConflictingUpdate {
            detail: detail.into(),
        }
    }
}

/// Result alias using `SpaceError`.
pub type Result<T> = std::result::Result<T, SpaceError>;
