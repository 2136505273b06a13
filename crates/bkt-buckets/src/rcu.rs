//! RCU slots for the per-device bucket arrays.
//!
//! Arrays are published with [`arc_swap::ArcSwapOption`]: readers take a
//! short-lived guard with no lock and no reference-count increment, writers
//! swap in a whole new array. A replaced array is released by dropping the
//! slot's `Arc`: arc-swap's guards keep their own reference, so the memory
//! goes away only once the last pre-swap reader is gone.
//!
//! # Logging
//!
//! - **DEBUG** `bkt::buckets::rcu`: `array_publish` (a new array was published)
//! - **TRACE** `bkt::buckets::rcu`: `array_retire` (the slot let go of an old array)

use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// One published array, possibly empty (the gc slot outside a gc run).
pub(crate) struct ArraySlot<T> {
    inner: ArcSwapOption<T>,
    publishes: AtomicU64,
    name: &'static str,
}

impl<T> fmt::Debug for ArraySlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArraySlot")
            .field("name", &self.name)
            .field("present", &self.inner.load().is_some())
            .field("publishes", &self.publishes.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + Sync + 'static> ArraySlot<T> {
    pub(crate) fn new(name: &'static str, value: T) -> Self {
        Self {
            inner: ArcSwapOption::from_pointee(value),
            publishes: AtomicU64::new(0),
            name,
        }
    }

    pub(crate) fn empty(name: &'static str) -> Self {
        Self {
            inner: ArcSwapOption::empty(),
            publishes: AtomicU64::new(0),
            name,
        }
    }

    /// Lock-free read of the current array. Do not hold the guard across
    /// anything that can block.
    #[inline]
    pub(crate) fn load(&self) -> arc_swap::Guard<Option<Arc<T>>> {
        self.inner.load()
    }

    /// Current array as an owned `Arc`, for callers that iterate at length.
    #[inline]
    pub(crate) fn load_full(&self) -> Option<Arc<T>> {
        self.inner.load_full()
    }

    #[must_use]
    pub(crate) fn is_present(&self) -> bool {
        self.inner.load().is_some()
    }

    /// Publish `value`, retiring whatever was there before.
    pub(crate) fn publish(&self, value: Arc<T>) {
        let old = self.inner.swap(Some(value));
        let count = self.publishes.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            target: "bkt::buckets::rcu",
            slot = self.name,
            publishes = count,
            "array_publish"
        );
        if let Some(old) = old {
            retire(self.name, old);
        }
    }

    /// Empty the slot, returning what it held. The caller decides whether to
    /// republish or retire it.
    pub(crate) fn take(&self) -> Option<Arc<T>> {
        self.inner.swap(None)
    }
}

/// Let go of an unpublished array. Readers that loaded it before the swap
/// keep it alive through their own `Arc`.
pub(crate) fn retire<T: Send + Sync + 'static>(slot: &'static str, old: Arc<T>) {
    trace!(
        target: "bkt::buckets::rcu",
        slot,
        strong = Arc::strong_count(&old),
        "array_retire"
    );
    drop(old);
}
