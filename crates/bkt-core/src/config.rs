//! Space accounting configuration.

use bkt_alloc::FreelistConfig;
use bkt_error::{Result, SpaceError};
use bkt_usage::default_shard_count;
use serde::{Deserialize, Serialize};

/// Tunables for one filesystem's space accounting.
///
/// Every field has a default, so a partial JSON document deserializes into
/// a complete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Counter shards per accumulator. `0` picks one per available CPU,
    /// capped at 16.
    pub shard_count: usize,
    /// Headroom kept back from reservations is `1 / (2^shift + 1)` of free
    /// space; the default of 6 keeps back 1/65.
    pub reserve_factor_shift: u32,
    /// Per-device freelist tier capacities.
    pub freelist: FreelistConfig,
    /// Open buckets allowed per device.
    pub max_open_buckets: usize,
    /// Restarts a transaction may take before its conflict is returned.
    pub max_transaction_restarts: u32,
    /// Fold the accumulators after this many commits. `0` disables.
    pub fold_every_commits: u64,
    /// Size of one btree node, charged per replica by btree node
    /// reservations.
    pub btree_node_sectors: u32,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            shard_count: 0,
            reserve_factor_shift: 6,
            freelist: FreelistConfig::default(),
            max_open_buckets: 64,
            max_transaction_restarts: 128,
            fold_every_commits: 1024,
            btree_node_sectors: 512,
        }
    }
}

impl SpaceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reserve_factor_shift == 0 || self.reserve_factor_shift > 16 {
            return Err(SpaceError::InvalidGeometry(format!(
                "reserve_factor_shift {} outside 1..=16",
                self.reserve_factor_shift
            )));
        }
        if self.max_open_buckets == 0 {
            return Err(SpaceError::InvalidGeometry(
                "max_open_buckets must be at least 1".to_owned(),
            ));
        }
        if self.freelist.incoming == 0 {
            return Err(SpaceError::InvalidGeometry(
                "freelist.incoming must be at least 1".to_owned(),
            ));
        }
        if self.btree_node_sectors == 0 {
            return Err(SpaceError::InvalidGeometry(
                "btree_node_sectors must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// `shard_count`, with `0` resolved.
    #[must_use]
    pub fn effective_shard_count(&self) -> usize {
        if self.shard_count == 0 {
            default_shard_count()
        } else {
            self.shard_count
        }
    }
}
