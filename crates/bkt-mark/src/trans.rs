//! Optimistic transactions over a [`KeyStore`].
//!
//! A transaction records the version of every key it reads, stages key
//! writes together with their marking deltas, and commits under the shared
//! mark lock. A conflict anywhere in the commit restarts the whole attempt
//! from scratch: staged deltas are dropped and recomputed, never patched.

use crate::delta::{MarkMode, ReplicasDeltaList, total_usage};
use crate::mark::{apply_at_commit, mark_key};
use bkt_core::{FsSpace, KeyStore};
use bkt_error::{Result, SpaceError};
use bkt_types::{Key, KeyPos};
use bkt_usage::{DiskReservation, ReserveMode};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

pub struct Transaction<'a, S: KeyStore + ?Sized> {
    space: &'a FsSpace,
    store: &'a S,
    reads: BTreeMap<KeyPos, u64>,
    writes: BTreeMap<KeyPos, Option<Key>>,
    lists: Vec<ReplicasDeltaList>,
    reservation: Option<DiskReservation>,
}

impl<S: KeyStore + ?Sized> std::fmt::Debug for Transaction<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .field("reservation", &self.reservation)
            .finish_non_exhaustive()
    }
}

impl<'a, S: KeyStore + ?Sized> Transaction<'a, S> {
    #[must_use]
    pub fn new(space: &'a FsSpace, store: &'a S) -> Self {
        Self {
            space,
            store,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            lists: Vec::new(),
            reservation: None,
        }
    }

    /// The key at `pos` as this transaction sees it: its own staged write if
    /// any, otherwise the store's current key, whose version is recorded
    /// for the commit check.
    pub fn get(&mut self, pos: KeyPos) -> Option<Key> {
        if let Some(staged) = self.writes.get(&pos) {
            return staged.clone();
        }
        let read = self.store.get(pos);
        self.reads.entry(pos).or_insert(read.version);
        read.key
    }

    /// Stage `key`, replacing whatever is at its position.
    pub fn insert(&mut self, key: Key) -> Result<()> {
        let old = self.get(key.pos);
        let list = mark_key(self.space, old.as_ref(), Some(&key), MarkMode::Commit)?;
        self.lists.push(list);
        self.writes.insert(key.pos, Some(key));
        Ok(())
    }

    /// Stage the deletion of the key at `pos`. Returns the key removed.
    pub fn delete(&mut self, pos: KeyPos) -> Result<Option<Key>> {
        let old = self.get(pos);
        if old.is_none() {
            return Ok(None);
        }
        let list = mark_key(self.space, old.as_ref(), None, MarkMode::Commit)?;
        self.lists.push(list);
        self.writes.insert(pos, None);
        Ok(old)
    }

    /// Reserve space for this transaction's growth: `sectors` per replica.
    /// Repeated calls grow one reservation.
    pub fn reserve(&mut self, sectors: u64, nr_replicas: u32, mode: ReserveMode) -> Result<()> {
        match &mut self.reservation {
            Some(r) => r.add(sectors, mode),
            None => {
                self.reservation = Some(self.space.reserve(sectors, nr_replicas, mode)?);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn deltas(&self) -> &[ReplicasDeltaList] {
        &self.lists
    }

    /// Install staged writes and apply their deltas. Returns the store
    /// version of the commit. Whatever remains of the reservation is
    /// released, on success or failure.
    pub fn commit(mut self) -> Result<u64> {
        let total = total_usage(&self.lists);
        self.space.ensure_replicas(&total);

        let reads: Vec<(KeyPos, u64)> = self.reads.iter().map(|(p, v)| (*p, *v)).collect();
        let writes: Vec<(KeyPos, Option<Key>)> = std::mem::take(&mut self.writes).into_iter().collect();
        let store = self.store;
        let version = {
            let marks = self.space.locks().read_marks();
            apply_at_commit(
                self.space,
                &self.lists,
                self.reservation.as_mut(),
                &marks,
                || store.commit(&reads, &writes),
            )?
        };
        if let Some(r) = self.reservation.take() {
            r.release();
        }
        debug!(
            target: "bkt::trans",
            version,
            reads = reads.len(),
            writes = writes.len(),
            sectors_added = total.sectors_added(),
            "trans_commit"
        );
        Ok(version)
    }
}

/// A committed transaction's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    pub version: u64,
    pub restarts: u32,
}

/// Run `body` in a fresh transaction and commit it, restarting on
/// `ConflictingUpdate` up to the configured budget. Any other error, or a
/// conflict past the budget, is returned.
pub fn run_transaction<S, T, F>(space: &FsSpace, store: &S, mut body: F) -> Result<Committed<T>>
where
    S: KeyStore + ?Sized,
    F: FnMut(&mut Transaction<'_, S>) -> Result<T>,
{
    let budget = space.config().max_transaction_restarts;
    let mut restarts = 0;
    loop {
        let mut tx = Transaction::new(space, store);
        let attempt = body(&mut tx).and_then(|value| tx.commit().map(|version| (value, version)));
        match attempt {
            Ok((value, version)) => {
                return Ok(Committed {
                    value,
                    version,
                    restarts,
                });
            }
            Err(SpaceError::ConflictingUpdate { detail }) if restarts < budget => {
                restarts += 1;
                trace!(target: "bkt::trans", restarts, detail = %detail, "trans_restart");
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(target: "bkt::trans", restarts, error = %e, "trans_restart_budget_exhausted");
                }
                return Err(e);
            }
        }
    }
}
