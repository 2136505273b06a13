//! Sharded counters with a folded base.
//!
//! Adds go to the calling thread's shard with a single relaxed `fetch_add`
//! and never block. Reads and folds take the base lock, so a read never
//! observes a shard after its contents have moved into the base but before
//! the base was updated.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: usize = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
}

/// Default shard count: one per hardware thread, at most 16.
#[must_use]
pub fn default_shard_count() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get().min(16))
}

#[inline]
fn shard_index(count: usize) -> usize {
    SHARD_HINT.with(|hint| *hint) % count
}

#[repr(align(64))]
#[derive(Debug)]
struct Shard {
    slots: Box<[AtomicI64]>,
}

impl Shard {
    fn new(width: usize) -> Self {
        Self {
            slots: (0..width).map(|_| AtomicI64::new(0)).collect(),
        }
    }
}

#[derive(Debug)]
pub struct Accumulator {
    width: usize,
    base: RwLock<Vec<i64>>,
    shards: Box<[Shard]>,
}

impl Accumulator {
    #[must_use]
    pub fn new(shard_count: usize, width: usize) -> Self {
        Self::with_base(shard_count, vec![0; width])
    }

    #[must_use]
    pub fn with_base(shard_count: usize, base: Vec<i64>) -> Self {
        let width = base.len();
        Self {
            width,
            base: RwLock::new(base),
            shards: (0..shard_count.max(1)).map(|_| Shard::new(width)).collect(),
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    pub fn add(&self, idx: usize, delta: i64) {
        if delta == 0 {
            return;
        }
        debug_assert!(idx < self.width, "counter {idx} outside width {}", self.width);
        let shard = &self.shards[shard_index(self.shards.len())];
        if let Some(slot) = shard.slots.get(idx) {
            slot.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Apply a dense delta vector (index = counter).
    pub fn add_dense(&self, deltas: &[i64]) {
        let shard = &self.shards[shard_index(self.shards.len())];
        for (slot, &delta) in shard.slots.iter().zip(deltas) {
            if delta != 0 {
                slot.fetch_add(delta, Ordering::Relaxed);
            }
        }
    }

    /// Base plus every shard.
    #[must_use]
    pub fn read(&self) -> Vec<i64> {
        let base = self.base.read();
        let mut out = base.clone();
        for shard in &*self.shards {
            for (acc, slot) in out.iter_mut().zip(&*shard.slots) {
                *acc += slot.load(Ordering::Relaxed);
            }
        }
        out
    }

    #[must_use]
    pub fn read_one(&self, idx: usize) -> i64 {
        let base = self.base.read();
        let mut total = base.get(idx).copied().unwrap_or(0);
        for shard in &*self.shards {
            if let Some(slot) = shard.slots.get(idx) {
                total += slot.load(Ordering::Relaxed);
            }
        }
        total
    }

    /// Move every shard's contents into the base.
    ///
    /// An add racing with the swap lands either in the drained value or in
    /// the freshly zeroed shard, never in neither.
    pub fn fold(&self) {
        let mut base = self.base.write();
        for shard in &*self.shards {
            for (acc, slot) in base.iter_mut().zip(&*shard.slots) {
                *acc += slot.swap(0, Ordering::Relaxed);
            }
        }
    }

    /// Fold, then return the base.
    #[must_use]
    pub fn fold_and_read(&self) -> Vec<i64> {
        self.fold();
        self.base.read().clone()
    }

    /// Discard shard contents and install `values` as the base.
    pub fn replace(&self, values: &[i64]) {
        let mut base = self.base.write();
        for shard in &*self.shards {
            for slot in &*shard.slots {
                slot.store(0, Ordering::Relaxed);
            }
        }
        base.clear();
        base.extend(values.iter().copied().chain(std::iter::repeat(0)).take(self.width));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn adds_fold_into_base() {
        let acc = Accumulator::new(4, 3);
        acc.add(0, 5);
        acc.add(2, -2);
        acc.add_dense(&[1, 1, 1]);
        assert_eq!(acc.read(), vec![6, 1, -1]);
        assert_eq!(acc.fold_and_read(), vec![6, 1, -1]);
        assert_eq!(acc.read_one(0), 6);
    }

    #[test]
    fn replace_discards_pending_shards() {
        let acc = Accumulator::new(2, 2);
        acc.add(1, 9);
        acc.replace(&[3]);
        assert_eq!(acc.read(), vec![3, 0]);
    }

    #[test]
    fn concurrent_adds_and_folds_lose_nothing() {
        let acc = Arc::new(Accumulator::new(4, 1));
        let threads = 6;
        let barrier = Arc::new(Barrier::new(threads + 1));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let acc = Arc::clone(&acc);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10_000 {
                        acc.add(0, 1);
                    }
                })
            })
            .collect();
        barrier.wait();
        for _ in 0..100 {
            acc.fold();
        }
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(acc.fold_and_read(), vec![60_000]);
    }
}
