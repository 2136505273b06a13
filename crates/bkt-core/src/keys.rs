//! The key-store seam: what the marking engine needs from the btree.
//!
//! The btree itself lives elsewhere. Transactions only need versioned point
//! reads and an atomic check-and-install at commit; the gc scan only needs
//! ordered iteration. [`MemKeyStore`] is an in-memory implementation with
//! first-committer-wins conflict detection.

use bkt_error::{Result, SpaceError};
use bkt_types::{Key, KeyPos};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Ordered read access, as consumed by the gc scan.
pub trait KeySource: Send + Sync {
    /// Up to `limit` live keys at or after `start`, in position order.
    fn keys_from(&self, start: KeyPos, limit: usize) -> Vec<Key>;
}

/// A key as read by a transaction, with the version that produced it.
/// Version `0` means the position has never been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVersion {
    pub key: Option<Key>,
    pub version: u64,
}

pub trait KeyStore: KeySource {
    fn get(&self, pos: KeyPos) -> KeyVersion;

    /// Install `writes` (`None` deletes) if every `(pos, version)` in
    /// `reads` is still current. Fails with `ConflictingUpdate` otherwise,
    /// installing nothing. Returns the new commit's version.
    fn commit(&self, reads: &[(KeyPos, u64)], writes: &[(KeyPos, Option<Key>)]) -> Result<u64>;
}

#[derive(Debug, Clone)]
struct Slot {
    key: Option<Key>,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    next_version: u64,
    slots: BTreeMap<KeyPos, Slot>,
}

impl Inner {
    fn version(&self, pos: KeyPos) -> u64 {
        self.slots.get(&pos).map_or(0, |s| s.version)
    }
}

/// In-memory versioned key map. Deleted positions keep a tombstone so a
/// delete still conflicts with a concurrent reader of the old key.
#[derive(Debug, Default)]
pub struct MemKeyStore {
    inner: RwLock<Inner>,
}

impl MemKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().slots.values().filter(|s| s.key.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Version of the last commit.
    #[must_use]
    pub fn latest_version(&self) -> u64 {
        self.inner.read().next_version
    }
}

impl KeySource for MemKeyStore {
    fn keys_from(&self, start: KeyPos, limit: usize) -> Vec<Key> {
        self.inner
            .read()
            .slots
            .range(start..)
            .filter_map(|(_, slot)| slot.key.clone())
            .take(limit)
            .collect()
    }
}

impl KeyStore for MemKeyStore {
    fn get(&self, pos: KeyPos) -> KeyVersion {
        let inner = self.inner.read();
        inner.slots.get(&pos).map_or(
            KeyVersion {
                key: None,
                version: 0,
            },
            |slot| KeyVersion {
                key: slot.key.clone(),
                version: slot.version,
            },
        )
    }

    fn commit(&self, reads: &[(KeyPos, u64)], writes: &[(KeyPos, Option<Key>)]) -> Result<u64> {
        let mut inner = self.inner.write();
        for &(pos, seen) in reads {
            let current = inner.version(pos);
            if current != seen {
                return Err(SpaceError::conflict(format!(
                    "key {pos} changed: read at version {seen}, now {current}"
                )));
            }
        }
        inner.next_version += 1;
        let version = inner.next_version;
        for (pos, key) in writes {
            inner.slots.insert(
                *pos,
                Slot {
                    key: key.clone(),
                    version,
                },
            );
        }
        Ok(version)
    }
}
