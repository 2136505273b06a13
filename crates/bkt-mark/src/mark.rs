//! Key marking: staging deltas for a key change and applying them at commit.

use crate::delta::{BucketDelta, MarkMode, ReplicasDeltaList, total_usage};
use bkt_buckets::{MarkReadGuard, MarkView};
use bkt_core::{Device, FsSpace, GcPos, add_sectors};
use bkt_error::{Result, SpaceError};
use bkt_types::{DataType, DeviceIdx, Key, KeyValue, ReplicasEntry};
use bkt_usage::DiskReservation;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Compute the mark and usage deltas of replacing `old` with `new` (either
/// may be absent). Reads bucket generations but changes nothing, so it is
/// safe to call speculatively and again after a restart.
///
/// In [`MarkMode::Commit`], a dirty pointer of `new` into a bucket that has
/// moved past it fails with `StaleReference`; stale pointers of `old` and
/// stale cached pointers are skipped and counted. A pointer into a device
/// that is gone, or into a bucket a shrink dropped, is stale the same way.
pub fn mark_key(space: &FsSpace, old: Option<&Key>, new: Option<&Key>, mode: MarkMode) -> Result<ReplicasDeltaList> {
    let mut list = ReplicasDeltaList::new(new.or(old).map(|k| k.pos));
    if let Some(old) = old {
        stage_key(space, &mut list, old, -1, mode)?;
    }
    if let Some(new) = new {
        stage_key(space, &mut list, new, 1, mode)?;
    }
    trace!(
        target: "bkt::mark",
        pos = ?list.pos,
        buckets = list.buckets.len(),
        stale = list.stale,
        ?mode,
        "mark_key"
    );
    Ok(list)
}

fn stage_key(space: &FsSpace, list: &mut ReplicasDeltaList, key: &Key, sign: i64, mode: MarkMode) -> Result<()> {
    match key.value {
        KeyValue::Inode => list.usage.add_inodes(sign),
        KeyValue::Reservation { nr_replicas } => {
            list.usage.add_reserved(nr_replicas, sign * i64::from(key.size));
        }
        KeyValue::Extent { .. } | KeyValue::BtreePtr { .. } => stage_ptrs(space, list, key, sign, mode)?,
    }
    Ok(())
}

fn stage_ptrs(space: &FsSpace, list: &mut ReplicasDeltaList, key: &Key, sign: i64, mode: MarkMode) -> Result<()> {
    let sectors = sign * i64::from(key.size);
    let adding = sign > 0;
    let mut dirty_devs: Vec<DeviceIdx> = Vec::new();
    let mut dirty_type = None;

    for ptr in key.ptrs() {
        let strict = mode == MarkMode::Commit && adding && !ptr.cached;
        let device = match space.device(ptr.dev) {
            Ok(device) => device,
            Err(e @ SpaceError::DeviceNotFound { .. }) => {
                if strict {
                    return Err(e);
                }
                list.stale += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        let bucket = device.geometry().sector_to_bucket(ptr.offset);
        let bucket_gen = match device.buckets().bucket_gen(bucket) {
            Ok(bucket_gen) => bucket_gen,
            Err(e @ SpaceError::BucketOutOfRange { .. }) => {
                if strict {
                    return Err(e);
                }
                list.stale += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        if bucket_gen.makes_stale(ptr.generation) {
            if strict {
                return Err(SpaceError::StaleReference {
                    dev: ptr.dev.0,
                    bucket: bucket.0,
                    ptr_gen: ptr.generation.0,
                    bucket_gen: bucket_gen.0,
                });
            }
            list.stale += 1;
            continue;
        }

        let data_type = key.ptr_data_type(ptr);
        if ptr.cached {
            list.usage
                .add_replicas(&ReplicasEntry::single(DataType::Cached, ptr.dev), sectors);
            list.buckets.push(BucketDelta {
                dev: ptr.dev,
                bucket,
                ptr_gen: ptr.generation,
                data_type,
                dirty: 0,
                cached: sectors,
            });
        } else {
            dirty_devs.push(ptr.dev);
            dirty_type = Some(data_type);
            list.buckets.push(BucketDelta {
                dev: ptr.dev,
                bucket,
                ptr_gen: ptr.generation,
                data_type,
                dirty: sectors,
                cached: 0,
            });
        }
    }

    if let Some(data_type) = dirty_type {
        let copies = i64::try_from(dirty_devs.len()).unwrap_or(i64::MAX);
        list.usage.add_replicas(
            &ReplicasEntry::new(data_type, 1, dirty_devs),
            sectors.saturating_mul(copies),
        );
    }
    Ok(())
}

struct Applied {
    device: Arc<Device>,
    delta: BucketDelta,
    gc: bool,
}

fn undo(applied: &[Applied], marks: &MarkReadGuard<'_>) {
    for a in applied.iter().rev() {
        let back = a.delta.negated();
        let view = if a.gc { MarkView::Gc(marks) } else { MarkView::Live };
        if let Err(e) = a.device.update_mark(back.bucket, view, marks, |m| {
            add_sectors(m, back.data_type, back.dirty, back.cached)
        }) {
            error!(
                target: "bkt::mark",
                dev = back.dev.0,
                bucket = back.bucket.0,
                error = %e,
                "mark_rollback_failed"
            );
        }
    }
}

/// Re-check every staged pointer against its bucket's current generation.
/// A bucket invalidated since staging means the attempt must restart.
pub fn validate_at_commit(space: &FsSpace, lists: &[ReplicasDeltaList], _marks: &MarkReadGuard<'_>) -> Result<()> {
    for d in lists.iter().flat_map(|l| l.buckets.iter()) {
        let current = match space.device(d.dev).and_then(|dev| dev.buckets().bucket_gen(d.bucket)) {
            Ok(current) => current,
            Err(SpaceError::DeviceNotFound { .. } | SpaceError::BucketOutOfRange { .. }) => {
                return Err(SpaceError::conflict(format!(
                    "bucket {}:{} went away after staging",
                    d.dev, d.bucket
                )));
            }
            Err(e) => return Err(e),
        };
        if current.makes_stale(d.ptr_gen) {
            return Err(SpaceError::conflict(format!(
                "bucket {}:{} moved to gen {current} after staging at gen {}",
                d.dev, d.bucket, d.ptr_gen
            )));
        }
    }
    let total = total_usage(lists);
    let missing = space.usage().missing_entries(&total);
    if let Some(entry) = missing.first() {
        return Err(SpaceError::conflict(format!("replicas entry {entry} not in usage layout")));
    }
    Ok(())
}

/// Apply staged deltas inside the commit window.
///
/// The caller holds the shared mark lock for the whole call, which keeps
/// generations and the gc cursor still. Deltas are validated first, then
/// `write_keys` installs the key change; if either fails nothing has been
/// touched. Marks are then updated live (and in the gc epoch for positions
/// the scan has already passed), usage is added, and `reservation` is
/// charged for the growth. A failure after `write_keys` is corruption: the
/// applied marks are rolled back and the filesystem latches read-only.
pub fn apply_at_commit<R>(
    space: &FsSpace,
    lists: &[ReplicasDeltaList],
    reservation: Option<&mut DiskReservation>,
    marks: &MarkReadGuard<'_>,
    write_keys: impl FnOnce() -> Result<R>,
) -> Result<R> {
    if space.is_read_only() {
        return Err(SpaceError::ReadOnly);
    }
    validate_at_commit(space, lists, marks)?;
    let out = write_keys()?;

    let mut applied: Vec<Applied> = Vec::new();
    let mut gc_lists = Vec::new();
    for list in lists {
        let dual = list.pos.is_some_and(|pos| space.gc_visited(GcPos::Key(pos)));
        if dual {
            gc_lists.push(list);
        }
        for d in &list.buckets {
            let device = match space.device(d.dev) {
                Ok(device) => device,
                Err(e) => {
                    undo(&applied, marks);
                    return Err(space.note_error(e));
                }
            };
            let views: &[bool] = if dual { &[false, true] } else { &[false] };
            for &gc in views {
                let view = if gc { MarkView::Gc(marks) } else { MarkView::Live };
                if let Err(e) = device.update_mark(d.bucket, view, marks, |m| {
                    add_sectors(m, d.data_type, d.dirty, d.cached)
                }) {
                    undo(&applied, marks);
                    let e = match e {
                        SpaceError::CorruptUsageState(_) => e,
                        other => SpaceError::CorruptUsageState(format!("mark apply after key write: {other}")),
                    };
                    return Err(space.note_error(e));
                }
                applied.push(Applied {
                    device: Arc::clone(&device),
                    delta: *d,
                    gc,
                });
            }
        }
    }

    let total = total_usage(lists);
    if let Err(e) = space.usage().add(&total, marks) {
        undo(&applied, marks);
        return Err(space.note_error(SpaceError::CorruptUsageState(format!(
            "usage add after key write: {e}"
        ))));
    }
    for list in gc_lists {
        space.gc_account(&list.usage);
    }

    let added = u64::try_from(total.sectors_added()).unwrap_or(0);
    if let Some(reservation) = reservation {
        let uncovered = reservation.consume(added);
        if uncovered > 0 {
            warn!(
                target: "bkt::mark",
                added,
                uncovered,
                "reservation_overrun"
            );
        }
    }
    space.note_commit();
    Ok(out)
}
