#![forbid(unsafe_code)]
//! Bucketkeeper public API facade.
//!
//! Re-exports the space accounting engine through one stable interface:
//! [`FsSpace`] for devices, allocation, reservations and usage reads, and
//! the transaction and gc entry points from `bkt-mark`. Lower layers stay
//! reachable through their own module paths for callers that need them.

pub use bkt_core::*;
pub use bkt_error::{Result, SpaceError};
pub use bkt_mark::{
    BucketDelta, Committed, GcReport, MarkMode, ReplicasDeltaList, Transaction, apply_at_commit, mark_key,
    run_gc, run_transaction, total_usage, validate_at_commit,
};
pub use bkt_types::{
    BucketIdx, BucketMark, DataType, DeviceGeometry, DeviceIdx, ExtentPtr, Generation, Key, KeyPos, KeyValue,
    MemberInfo, ReplicasEntry,
};
pub use bkt_usage::{DevUsage, DiskReservation, FsUsage, FsUsageDelta, ReserveMode};

pub mod alloc {
    pub use bkt_alloc::*;
}

pub mod buckets {
    pub use bkt_buckets::*;
}

pub mod usage {
    pub use bkt_usage::*;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_drives_a_commit_end_to_end() {
        let fs = FsSpace::new(SpaceConfig::default()).expect("space");
        fs.add_device(DeviceIdx(0), MemberInfo::bare(16, 64, 1), DeviceState::ReadWrite)
            .expect("add");
        let store = MemKeyStore::new();
        let key = Key::extent(
            KeyPos::new(1, 0),
            8,
            vec![ExtentPtr {
                dev: DeviceIdx(0),
                offset: 5 * 16,
                generation: Generation(0),
                cached: false,
            }],
        );
        run_transaction(&fs, &store, |tx| tx.insert(key.clone())).expect("commit");
        assert_eq!(fs.fs_usage().data, 8);

        let report = run_gc(&fs, &store, 16).expect("gc");
        assert_eq!(report.buckets_mismatched, 0);
        let json = serde_json::to_string(&fs.snapshot()).expect("json");
        assert!(json.contains("\"data\":8"));
    }
}
