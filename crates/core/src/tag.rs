//! Tagged `begin`/`end` fields (spec.md §4.1).
//!
//! A `begin`/`end` field on a record is either a *committed timestamp* or a
//! *transaction reference*: a handle to the in-flight transaction that owns
//! the record, whose own state cell carries `{ACTIVE, PREPARING, COMMITTED,
//! ABORTED}` plus a proposed/commit time.
//!
//! The design notes (spec.md §9) call for hiding the tagged union behind a
//! sum-type abstraction with accessor functions and never exposing the raw
//! bits outside the module. We go one step further than the original's
//! single reserved low bit: rather than stealing a bit out of a full-range
//! 64-bit timestamp (which would collide with legitimate odd intra-batch
//! indices), we store the discriminant in its own `AtomicU8` alongside an
//! `AtomicU64` payload. The writer updates payload-then-tag under the slot
//! latch (single-writer), so this is still a single-producer/many-reader
//! field; it just avoids bit-stealing.

use crate::timestamp::LogicalTimestamp;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// The lifecycle state of an in-flight transaction, as observed by readers
/// resolving a commit dependency or deciding whether a version is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    /// Executing its now-phase; not yet validated.
    Active = 0,
    /// Now-phase succeeded; validating and waiting on commit dependencies.
    Preparing = 1,
    /// All dependencies resolved; writes are finalized.
    Committed = 2,
    /// Aborted; writes are being (or have been) removed.
    Aborted = 3,
}

impl TxnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TxnState::Active,
            1 => TxnState::Preparing,
            2 => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }

    /// `true` for `Preparing` and `Committed` — states that carry a
    /// meaningful (not-necessarily-final) time a reader can compare against.
    pub fn at_least_preparing(self) -> bool {
        matches!(self, TxnState::Preparing | TxnState::Committed)
    }
}

/// A shared cell describing one transaction's current lifecycle state and
/// proposed/commit time. Readers that observe an uncommitted record hold an
/// `Arc<TxnCell>` clone to poll this; the owning worker is the sole writer.
///
/// `dependents` is opaque bookkeeping for the commit-dependency protocol
/// (spec.md §4.3): a reader that takes a dependency on this cell registers
/// its `(home_worker_id, txn_id)` here, and the owning worker drains the
/// list once, at finalization, to know who to notify. `TxnCell` does not
/// interpret these ids itself.
#[derive(Debug)]
pub struct TxnCell {
    state: AtomicU8,
    time: AtomicU64,
    dependents: std::sync::Mutex<Vec<(usize, u64)>>,
}

impl TxnCell {
    /// A fresh cell for a transaction that has just started its now-phase.
    pub fn new_active() -> Self {
        TxnCell {
            state: AtomicU8::new(TxnState::Active as u8),
            time: AtomicU64::new(LogicalTimestamp::INF.raw()),
            dependents: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Record that `(home_worker_id, txn_id)` has taken a commit dependency
    /// on this transaction. Safe to call concurrently with other readers;
    /// racing with `take_dependents` may miss a registration that arrives
    /// after the cell has already reached a terminal state, so callers must
    /// re-check `load` after registering (see `chronodb_txn::context`).
    pub fn register_dependent(&self, home_worker_id: usize, txn_id: u64) {
        self.dependents.lock().unwrap().push((home_worker_id, txn_id));
    }

    /// Drain and return every registered dependent. Called once, by the
    /// owning worker, when this transaction reaches a terminal state.
    pub fn take_dependents(&self) -> Vec<(usize, u64)> {
        std::mem::take(&mut *self.dependents.lock().unwrap())
    }

    /// Move to `Preparing` with the given commit timestamp. Called once, by
    /// the owning worker, after now-phase returns `true`.
    pub fn mark_preparing(&self, commit_ts: LogicalTimestamp) {
        self.time.store(commit_ts.raw(), Ordering::Release);
        self.state.store(TxnState::Preparing as u8, Ordering::Release);
    }

    /// Move to `Committed`. Called once, after all commit dependencies
    /// resolve to `Committed`.
    pub fn mark_committed(&self) {
        self.state.store(TxnState::Committed as u8, Ordering::Release);
    }

    /// Move to `Aborted`. Called once, on now-phase failure or dependency
    /// failure.
    pub fn mark_aborted(&self) {
        self.state.store(TxnState::Aborted as u8, Ordering::Release);
    }

    /// The current `(state, time)` pair. `time` is only meaningful once
    /// `state.at_least_preparing()`.
    pub fn load(&self, order: Ordering) -> (TxnState, LogicalTimestamp) {
        let state = TxnState::from_u8(self.state.load(order));
        let time = LogicalTimestamp::from_raw(self.time.load(order));
        (state, time)
    }
}

/// The decoded contents of a `begin`/`end` field.
pub enum FieldValue {
    /// A committed timestamp.
    Committed(LogicalTimestamp),
    /// A handle to the transaction that currently owns this version.
    TxnRef(Arc<TxnCell>),
}

const TAG_COMMITTED: u8 = 0;
const TAG_TXN_REF: u8 = 1;

/// A `begin` or `end` field on a record: either a committed timestamp or a
/// reference to the owning in-flight transaction's state cell.
///
/// All-zero (the default) decodes as `Committed(LogicalTimestamp::ZERO)`,
/// matching the "zero is the genesis sentinel" rule in spec.md §3.
#[derive(Debug)]
pub struct TaggedField {
    tag: AtomicU8,
    payload: AtomicU64,
}

impl TaggedField {
    /// A field holding a committed timestamp.
    pub fn committed(ts: LogicalTimestamp) -> Self {
        TaggedField {
            tag: AtomicU8::new(TAG_COMMITTED),
            payload: AtomicU64::new(ts.raw()),
        }
    }

    /// A field holding a reference to an in-flight transaction.
    pub fn txn_ref(cell: Arc<TxnCell>) -> Self {
        let raw = Arc::into_raw(cell) as u64;
        TaggedField {
            tag: AtomicU8::new(TAG_TXN_REF),
            payload: AtomicU64::new(raw),
        }
    }

    /// Decode the current value. For `TxnRef`, clones the `Arc` (bumping the
    /// strong count) rather than consuming the stored reference, so repeated
    /// reads are safe.
    pub fn load(&self, order: Ordering) -> FieldValue {
        match self.tag.load(order) {
            TAG_TXN_REF => {
                let ptr = self.payload.load(order) as *const TxnCell;
                // SAFETY: a TxnRef payload is only ever written by
                // `txn_ref`/`store_txn_ref`, which transfer ownership of one
                // `Arc<TxnCell>` strong count into the raw pointer. We
                // reconstruct a temporary `Arc` to clone from, then forget
                // it so the stored strong count is left untouched; ownership
                // is only released by `take_txn_ref`.
                let borrowed = unsafe { Arc::from_raw(ptr) };
                let cloned = Arc::clone(&borrowed);
                std::mem::forget(borrowed);
                FieldValue::TxnRef(cloned)
            }
            _ => {
                let raw = self.payload.load(order);
                FieldValue::Committed(LogicalTimestamp::from_raw(raw))
            }
        }
    }

    /// Overwrite the field with a committed timestamp. If the field
    /// previously held a `TxnRef`, the caller must have already released
    /// that reference via `take_txn_ref` (finalize/remove do this).
    pub fn store_committed(&self, ts: LogicalTimestamp, order: Ordering) {
        self.payload.store(ts.raw(), order);
        self.tag.store(TAG_COMMITTED, order);
    }

    /// Overwrite the field with a fresh transaction reference, taking
    /// ownership of one strong count.
    pub fn store_txn_ref(&self, cell: Arc<TxnCell>, order: Ordering) {
        let raw = Arc::into_raw(cell) as u64;
        self.payload.store(raw, order);
        self.tag.store(TAG_TXN_REF, order);
    }

    /// `true` if the field currently holds a committed timestamp.
    pub fn is_committed(&self, order: Ordering) -> bool {
        self.tag.load(order) == TAG_COMMITTED
    }

    /// Release the `Arc<TxnCell>` strong count owned by this field, if any.
    /// Called exactly once, when a record transitions away from being
    /// owned by an in-flight transaction (finalize or abort).
    pub fn take_txn_ref(&self, order: Ordering) -> Option<Arc<TxnCell>> {
        if self.tag.load(order) != TAG_TXN_REF {
            return None;
        }
        let ptr = self.payload.load(order) as *const TxnCell;
        // SAFETY: see `load` — this reclaims the strong count that
        // `txn_ref`/`store_txn_ref` transferred in. Callers must ensure this
        // runs at most once per transfer (finalize/remove run once per
        // record, under the slot latch).
        Some(unsafe { Arc::from_raw(ptr) })
    }
}
