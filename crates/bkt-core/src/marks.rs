//! Sector arithmetic on mark words, and the gc scan position.

use bkt_error::{Result, SpaceError};
use bkt_types::{BucketMark, DataType, KeyPos};

fn apply_delta(current: u32, delta: i64, what: &str, data_type: DataType) -> Result<u32> {
    let next = i64::from(current) + delta;
    u32::try_from(next).map_err(|_| {
        SpaceError::CorruptUsageState(format!(
            "{what} sectors of {data_type} bucket would become {next} (was {current}, delta {delta})"
        ))
    })
}

/// `mark` with `dirty` and `cached` sector deltas applied on behalf of a
/// pointer or metadata region of `data_type`.
///
/// Dirty sectors pin the bucket's data type; adding dirty sectors of a
/// different type than the bucket already holds is corruption. A bucket
/// that ends up with no sectors at all drops back to [`DataType::None`]
/// unless it holds fixed metadata. Size checks against the bucket happen in
/// the compare-exchange loop.
pub fn add_sectors(mark: BucketMark, data_type: DataType, dirty: i64, cached: i64) -> Result<BucketMark> {
    let mut next = mark;
    if dirty != 0 {
        let held = mark.data_type();
        if dirty > 0 && mark.dirty_sectors() > 0 && held != data_type {
            return Err(SpaceError::CorruptUsageState(format!(
                "bucket holds {held} data, adding {dirty} {data_type} sectors"
            )));
        }
        next = next
            .with_dirty_sectors(apply_delta(mark.dirty_sectors(), dirty, "dirty", data_type)?)
            .with_data_type(if dirty > 0 { data_type } else { held });
    }
    if cached != 0 {
        next = next.with_cached_sectors(apply_delta(mark.cached_sectors(), cached, "cached", data_type)?);
    }
    if next.total_sectors() == 0 && !next.data_type().is_fixed_metadata() {
        next = next.with_data_type(DataType::None);
    }
    Ok(next)
}

/// How far the gc scan has got.
///
/// Positions order as `Start < Metadata < Key(..) < Done`. The cursor is
/// the first position not yet visited; everything strictly below it has
/// been folded into the gc epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcPos {
    Start,
    /// Superblock and journal buckets.
    Metadata,
    Key(KeyPos),
    Done,
}

impl GcPos {
    /// The cursor value after visiting the key at `pos`.
    #[must_use]
    pub fn after_key(pos: KeyPos) -> Self {
        if pos == KeyPos::MAX {
            Self::Done
        } else {
            Self::Key(pos.successor())
        }
    }
}
