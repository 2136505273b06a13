//! The mark-and-sweep scan that rebuilds bucket marks and usage from keys.
//!
//! The scan builds a fresh gc epoch alongside live: fixed metadata first,
//! then every key in position order, in batches. Each batch runs under the
//! exclusive mark lock, so no commit can land between reading a key and
//! marking it. Between batches commits proceed; those at positions already
//! scanned are applied to both epochs. When the scan finishes, the rebuilt
//! epoch replaces live, with any disagreement logged and repaired.

use crate::delta::MarkMode;
use crate::mark::mark_key;
use bkt_buckets::{MarkView, MarkWriteGuard};
use bkt_core::{FsSpace, GcPos, KeySource, add_sectors};
use bkt_error::{Result, SpaceError};
use bkt_types::{Key, KeyPos};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub keys: u64,
    pub batches: u64,
    /// Pointers into buckets that have moved past them.
    pub stale_ptrs: u64,
    pub buckets_mismatched: usize,
    pub usage_mismatches: usize,
}

/// Run one full gc pass. Holds the gc lock throughout, so device
/// add/remove/resize wait for it.
pub fn run_gc(space: &FsSpace, source: &dyn KeySource, batch: usize) -> Result<GcReport> {
    let started = Instant::now();
    let gc = space.locks().lock_gc();
    space.begin_gc(&gc)?;
    let mut report = match scan(space, source, batch.max(1)) {
        Ok(report) => report,
        Err(e) => {
            space.abort_gc(&gc);
            return Err(space.note_error(e));
        }
    };
    let published = space.finish_gc(&gc).map_err(|e| space.note_error(e))?;
    report.buckets_mismatched = published.buckets_mismatched;
    report.usage_mismatches = published.usage_mismatches.len();
    info!(
        target: "bkt::gc",
        keys = report.keys,
        batches = report.batches,
        stale_ptrs = report.stale_ptrs,
        buckets_mismatched = report.buckets_mismatched,
        usage_mismatches = report.usage_mismatches,
        elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        "gc_done"
    );
    Ok(report)
}

fn scan(space: &FsSpace, source: &dyn KeySource, batch: usize) -> Result<GcReport> {
    let mut report = GcReport::default();
    {
        let marks = space.locks().write_marks();
        space.set_gc_pos(GcPos::Metadata, &marks);
        space.mark_metadata_gc(&marks)?;
    }

    let mut start = KeyPos::MIN;
    loop {
        let marks = space.locks().write_marks();
        let keys = source.keys_from(start, batch);
        for key in &keys {
            mark_key_gc(space, key, &marks, &mut report)?;
            space.set_gc_pos(GcPos::after_key(key.pos), &marks);
        }
        report.batches += 1;
        debug!(target: "bkt::gc", start = %start, keys = keys.len(), "gc_batch");
        match keys.last() {
            Some(last) if keys.len() == batch && last.pos != KeyPos::MAX => {
                start = last.pos.successor();
            }
            _ => {
                space.set_gc_pos(GcPos::Done, &marks);
                return Ok(report);
            }
        }
    }
}

fn mark_key_gc(space: &FsSpace, key: &Key, marks: &MarkWriteGuard<'_>, report: &mut GcReport) -> Result<()> {
    // Every pointer, stale or not, bounds how far its bucket's generation
    // may advance. Pointers past the end of a shrunk device bound nothing.
    for ptr in key.ptrs() {
        if let Ok(device) = space.device(ptr.dev) {
            let bucket = device.geometry().sector_to_bucket(ptr.offset);
            match device
                .buckets()
                .note_ptr_gen(bucket, ptr.generation, MarkView::Gc(marks))
            {
                Ok(()) | Err(SpaceError::BucketOutOfRange { .. }) => {}
                Err(e) => return Err(e),
            }
        }
    }
    let list = mark_key(space, None, Some(key), MarkMode::Gc)?;
    for d in list.buckets() {
        let device = space.device(d.dev)?;
        device.update_mark(d.bucket, MarkView::Gc(marks), marks, |m| {
            add_sectors(m, d.data_type, d.dirty, d.cached)
        })?;
    }
    space.gc_account(list.usage());
    report.keys += 1;
    report.stale_ptrs += list.stale();
    Ok(())
}
