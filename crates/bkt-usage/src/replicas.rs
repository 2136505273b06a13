//! The set of replication schemes that currently own a usage counter.

use bkt_types::ReplicasEntry;
use std::collections::BTreeMap;

/// Entries in counter order. Indices are stable: new entries append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicasTable {
    entries: Vec<ReplicasEntry>,
    index: BTreeMap<ReplicasEntry, usize>,
}

impl ReplicasTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn position(&self, entry: &ReplicasEntry) -> Option<usize> {
        self.index.get(entry).copied()
    }

    #[must_use]
    pub fn contains(&self, entry: &ReplicasEntry) -> bool {
        self.index.contains_key(entry)
    }

    /// Append `entry` if missing; returns its index either way.
    pub fn insert(&mut self, entry: ReplicasEntry) -> usize {
        if let Some(&idx) = self.index.get(&entry) {
            return idx;
        }
        let idx = self.entries.len();
        self.index.insert(entry.clone(), idx);
        self.entries.push(entry);
        idx
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicasEntry> {
        self.entries.iter()
    }
}
