#![forbid(unsafe_code)]
//! Transactional key marking.
//!
//! Keeps bucket marks and usage counters in step with key contents.
//! [`mark_key`] turns one key change into a [`ReplicasDeltaList`] without
//! touching shared state; [`apply_at_commit`] applies the staged lists inside
//! the commit window of the key write, exactly once. [`Transaction`] and
//! [`run_transaction`] wrap both around a [`KeyStore`](bkt_core::KeyStore)
//! with first-committer-wins conflict detection and whole-attempt restart.
//! [`run_gc`] rebuilds marks and usage from the keys themselves.
//!
//! # Logging
//!
//! - **TRACE** `bkt::mark`: `mark_key`; `bkt::trans`: `trans_restart`
//! - **DEBUG** `bkt::trans`: `trans_commit`; `bkt::gc`: `gc_batch`
//! - **INFO** `bkt::gc`: `gc_done`
//! - **WARN** `bkt::mark`: `reservation_overrun`; `bkt::trans`: `trans_restart_budget_exhausted`
//! - **ERROR** `bkt::mark`: `mark_rollback_failed`

mod delta;
mod gc;
mod mark;
mod trans;

pub use delta::{BucketDelta, MarkMode, ReplicasDeltaList, total_usage};
pub use gc::{GcReport, run_gc};
pub use mark::{apply_at_commit, mark_key, validate_at_commit};
pub use trans::{Committed, Transaction, run_transaction};
