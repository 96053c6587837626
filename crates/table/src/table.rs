//! The versioned table: a fixed-size array of slots, one per primary key
//! (spec.md §3, §4.2).

use crate::record::{RecordNode, RecordSlab};
use crate::slot::Slot;
use chronodb_core::{Error, FieldValue, LogicalTimestamp, Result, TaggedField, TxnCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A handle to a version this worker holds the latch for: returned by
/// `insert_version`, consumed by `finalize_version` or `remove_version`.
pub struct RecordHandle<V> {
    ptr: *mut RecordNode<V>,
    key: u64,
}

// SAFETY: a `RecordHandle` is only ever touched by the worker that holds
// the corresponding slot's latch; the pointer it carries is stable for the
// life of the owning `RecordSlab` (never freed while linked).
unsafe impl<V: Send> Send for RecordHandle<V> {}

impl<V> RecordHandle<V> {
    /// The key this handle's record belongs to.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Raw pointer to the pending node, e.g. to let the caller mutate
    /// `value` in place before finalizing (not required by the core
    /// contract, but convenient for in-place read-modify-write bodies).
    ///
    /// # Safety
    /// Valid only until `finalize_version`/`remove_version` consumes this
    /// handle, and only from the worker holding the slot's latch.
    pub unsafe fn value_mut(&self) -> &mut V {
        &mut (*self.ptr).value
    }
}

/// A fixed-size array of slots, one per key in `[0, num_records)`.
///
/// Readers are lock-free; writers serialize per-key via each slot's latch.
/// `force_insert` is for initialization only and bypasses concurrency
/// control entirely (spec.md §4.2).
pub struct VersionedTable<V> {
    table_id: u32,
    slots: Vec<Slot<V>>,
    init_done: AtomicBool,
}

impl<V> VersionedTable<V> {
    /// Create a table with `num_records` empty slots.
    pub fn new(table_id: u32, num_records: usize) -> Self {
        let mut slots = Vec::with_capacity(num_records);
        slots.resize_with(num_records, Slot::empty);
        VersionedTable { table_id, slots, init_done: AtomicBool::new(false) }
    }

    /// Number of slots (the configured key range).
    pub fn num_records(&self) -> usize {
        self.slots.len()
    }

    /// This table's id, as carried in `CompositeKey::table_id`.
    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    fn slot(&self, key: u64) -> &Slot<V> {
        &self.slots[key as usize]
    }

    /// Insert a record without any concurrency control. Initialization
    /// only: asserts `init_done == false`.
    ///
    /// # Panics
    /// Panics if called after `finish_init`.
    pub fn force_insert(&self, slab: &mut RecordSlab<V>, key: u64, value: V) {
        assert!(!self.init_done.load(Ordering::Relaxed), "force_insert after finish_init");
        let slot = self.slot(key);
        #[cfg(debug_assertions)]
        assert!(!slot.is_latched());

        let begin = TaggedField::committed(LogicalTimestamp::ZERO);
        let end = TaggedField::committed(LogicalTimestamp::INF);
        let ptr = slab.alloc(key, value, begin, end);
        // SAFETY: freshly allocated, not yet published; exclusive access.
        unsafe { (*ptr).next.store(slot.head.load(Ordering::Relaxed), Ordering::Relaxed) };
        slot.head.store(ptr, Ordering::Relaxed);
    }

    /// Mark initialization complete. After this, `force_insert` panics and
    /// normal concurrency-controlled operations are expected.
    pub fn finish_init(&self) {
        assert!(!self.init_done.load(Ordering::Relaxed), "finish_init called twice");
        self.init_done.store(true, Ordering::Release);
    }

    fn assert_init_done(&self) {
        debug_assert!(self.init_done.load(Ordering::Acquire), "table used before finish_init");
    }

    /// Return the version of `key` valid at `ts`, if any (spec.md §4.2).
    ///
    /// Lock-free: retries on a torn snapshot, never blocks on a writer. If
    /// the returned record is still pending (its `begin` is a `TxnRef`), the
    /// caller has implicitly taken on a commit dependency on that
    /// transaction and must not consider its own read stable until that
    /// transaction resolves.
    pub fn get_version(&self, key: u64, ts: LogicalTimestamp) -> Option<&RecordNode<V>> {
        self.assert_init_done();
        let slot = self.slot(key);
        loop {
            let cur = slot.head.load(Ordering::Acquire);
            if cur.is_null() {
                return None;
            }
            // SAFETY: nodes reachable from a slot are never freed while the
            // table is alive (slab ownership outlives readers).
            let cur_ref = unsafe { &*cur };
            let prev = cur_ref.next.load(Ordering::Acquire);
            let cur_committed = cur_ref.begin.is_committed(Ordering::Acquire);
            let prev_committed = prev.is_null() || unsafe { &*prev }.begin.is_committed(Ordering::Acquire);

            if !(cur_committed || prev.is_null() || prev_committed) {
                trace!(table = self.table_id, key, "torn snapshot, retrying get_version");
                continue;
            }

            if let Some(effective_ts) = Self::effective_time(cur_ref) {
                if effective_ts < ts {
                    return Some(cur_ref);
                }
            }
            if !prev.is_null() {
                // SAFETY: nodes reachable from a slot are never freed while
                // the table is alive.
                return unsafe { Self::search_stable(key, ts, prev) };
            }
            return None;
        }
    }

    /// The time at which `node` became (or will become, if preparing)
    /// visible: `Some(t)` for committed or preparing-or-later versions,
    /// `None` for `Active` (not yet validated) owners.
    fn effective_time(node: &RecordNode<V>) -> Option<LogicalTimestamp> {
        match node.begin.load(Ordering::Acquire) {
            FieldValue::Committed(ts) => Some(ts),
            FieldValue::TxnRef(cell) => {
                let (state, time) = cell.load(Ordering::Acquire);
                if state.at_least_preparing() {
                    Some(time)
                } else {
                    None
                }
            }
        }
    }

    /// Walk a chain known to be committed from `iter` onward, returning the
    /// first version matching `key` valid at `ts` (spec.md §4.2,
    /// `search_stable`).
    ///
    /// # Safety
    /// `iter` must be a valid pointer into a chain owned by a live
    /// `VersionedTable` (or null).
    unsafe fn search_stable<'a>(key: u64, ts: LogicalTimestamp, mut iter: *mut RecordNode<V>) -> Option<&'a RecordNode<V>> {
        while !iter.is_null() {
            let node = &*iter;
            debug_assert!(node.begin.is_committed(Ordering::Acquire), "search_stable on pending node");
            if node.key == key {
                if let FieldValue::Committed(begin_ts) = node.begin.load(Ordering::Acquire) {
                    if begin_ts < ts {
                        return Some(node);
                    }
                }
            }
            iter = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Try to publish `new_record` as the new head of `key`'s chain.
    ///
    /// On success, the slot's latch is held until the caller calls
    /// `finalize_version` or `remove_version` on the returned handle. On
    /// failure (another writer holds the latch), returns
    /// `Error::WriteConflict` and the caller's transaction aborts.
    pub fn insert_version(&self, key: u64, new_record: *mut RecordNode<V>) -> Result<RecordHandle<V>> {
        self.assert_init_done();
        let slot = self.slot(key);
        if !slot.try_latch() {
            return Err(Error::WriteConflict { table_id: self.table_id, key });
        }

        let prev_head = slot.head.load(Ordering::Acquire);
        // SAFETY: `new_record` was just allocated by the caller's slab and
        // is not yet reachable from any slot.
        let new_ref = unsafe { &*new_record };
        if !prev_head.is_null() {
            // Mirror the pending `begin` into the predecessor's `end`
            // (invariant 2), taking a fresh reference to the same owner.
            if let FieldValue::TxnRef(owner) = new_ref.begin.load(Ordering::Acquire) {
                let prev_ref = unsafe { &*prev_head };
                prev_ref.end.store_txn_ref(owner, Ordering::Release);
            }
        }
        new_ref.next.store(prev_head, Ordering::Release);
        slot.head.store(new_record, Ordering::Release);

        Ok(RecordHandle { ptr: new_record, key })
    }

    /// Commit path: stamp `begin`/predecessor's `end` with `ts` and release
    /// the latch (spec.md §4.2).
    pub fn finalize_version(&self, handle: RecordHandle<V>, ts: LogicalTimestamp) {
        let slot = self.slot(handle.key);
        #[cfg(debug_assertions)]
        assert!(slot.is_latched());

        // SAFETY: `handle` is the record this worker just latched.
        let node = unsafe { &*handle.ptr };
        let owner = node.begin.take_txn_ref(Ordering::Acquire);
        debug_assert!(owner.is_some(), "finalize on an already-committed record");
        node.begin.store_committed(ts, Ordering::Release);

        let prev = node.next.load(Ordering::Acquire);
        if !prev.is_null() {
            let prev_ref = unsafe { &*prev };
            let _ = prev_ref.end.take_txn_ref(Ordering::Acquire);
            prev_ref.end.store_committed(ts, Ordering::Release);
        }
        slot.unlatch();
    }

    /// Abort path: unlink the record, restore the predecessor's `end`, and
    /// release the latch. Returns the unlinked pointer so the caller can
    /// hand it back to its slab for reuse.
    pub fn remove_version(&self, handle: RecordHandle<V>, ts: LogicalTimestamp) -> *mut RecordNode<V> {
        let slot = self.slot(handle.key);
        #[cfg(debug_assertions)]
        {
            assert!(slot.is_latched());
            assert_eq!(slot.head.load(Ordering::Acquire), handle.ptr, "remove_version on non-head record");
        }

        // SAFETY: see `finalize_version`.
        let node = unsafe { &*handle.ptr };
        let prev = node.next.load(Ordering::Acquire);
        slot.head.store(prev, Ordering::Release);
        if !prev.is_null() {
            let prev_ref = unsafe { &*prev };
            let _ = prev_ref.end.take_txn_ref(Ordering::Acquire);
            prev_ref.end.store_committed(ts, Ordering::Release);
        }
        let _ = node.begin.take_txn_ref(Ordering::Acquire);
        slot.unlatch();
        handle.ptr
    }
}

/// Convenience for tests/demos: wrap an owning `Arc<TxnCell>` alongside the
/// table and slab a single-threaded caller needs to drive a write.
pub fn begin_write<V>(owner: &Arc<TxnCell>, key: u64, value: V, slab: &mut RecordSlab<V>) -> *mut RecordNode<V> {
    let begin = TaggedField::txn_ref(Arc::clone(owner));
    let end = TaggedField::committed(LogicalTimestamp::INF);
    slab.alloc(key, value, begin, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronodb_core::TxnState;

    fn fresh_table(n: usize) -> (VersionedTable<i64>, RecordSlab<i64>) {
        let table = VersionedTable::new(1, n);
        let mut slab = RecordSlab::new();
        for k in 0..n as u64 {
            table.force_insert(&mut slab, k, 0);
        }
        table.finish_init();
        (table, slab)
    }

    #[test]
    fn single_insert_single_read() {
        let (table, mut slab) = fresh_table(1000);
        let owner = Arc::new(TxnCell::new_active());
        let ptr = begin_write(&owner, 42, 1, &mut slab);
        let handle = table.insert_version(42, ptr).unwrap();

        owner.mark_preparing(LogicalTimestamp::new(1, 0));
        owner.mark_committed();
        table.finalize_version(handle, LogicalTimestamp::new(1, 0));

        let read = table.get_version(42, LogicalTimestamp::new(1, 1)).unwrap();
        assert_eq!(read.value, 1);
        let older = table.get_version(42, LogicalTimestamp::new(0, 1));
        assert!(older.is_none() || older.unwrap().value == 0);
    }

    #[test]
    fn write_write_conflict_one_loser() {
        let (table, mut slab) = fresh_table(100);
        let owner_a = Arc::new(TxnCell::new_active());
        let owner_b = Arc::new(TxnCell::new_active());
        let ptr_a = begin_write(&owner_a, 7, 10, &mut slab);

        let handle_a = table.insert_version(7, ptr_a).unwrap();
        let ptr_b = begin_write(&owner_b, 7, 20, &mut slab);
        let err = table.insert_version(7, ptr_b);
        assert!(matches!(err, Err(Error::WriteConflict { .. })));

        owner_a.mark_preparing(LogicalTimestamp::new(1, 0));
        owner_a.mark_committed();
        table.finalize_version(handle_a, LogicalTimestamp::new(1, 0));

        let v = table.get_version(7, LogicalTimestamp::new(2, 0)).unwrap();
        assert_eq!(v.value, 10);
    }

    #[test]
    fn reader_sees_prepared_writer_as_dependency() {
        let (table, mut slab) = fresh_table(100);
        let owner = Arc::new(TxnCell::new_active());
        let ptr = begin_write(&owner, 9, 99, &mut slab);
        let handle = table.insert_version(9, ptr).unwrap();
        owner.mark_preparing(LogicalTimestamp::new(1, 0));

        // Reader starts after W's proposed commit time.
        let read = table.get_version(9, LogicalTimestamp::new(1, 5)).unwrap();
        assert_eq!(read.value, 99);
        match read.begin.load(Ordering::Acquire) {
            FieldValue::TxnRef(cell) => {
                let (state, _) = cell.load(Ordering::Acquire);
                assert_eq!(state, TxnState::Preparing);
            }
            _ => panic!("expected a pending version carrying a dependency"),
        }

        owner.mark_aborted();
        let removed = table.remove_version(handle, LogicalTimestamp::INF);
        unsafe { slab.release(removed) };

        let after_abort = table.get_version(9, LogicalTimestamp::new(2, 0)).unwrap();
        assert_eq!(after_abort.value, 0);
    }

    #[test]
    fn abort_restores_predecessor_end() {
        let (table, mut slab) = fresh_table(10);
        let owner = Arc::new(TxnCell::new_active());
        let ptr = begin_write(&owner, 3, 55, &mut slab);
        let handle = table.insert_version(3, ptr).unwrap();
        owner.mark_aborted();
        let removed = table.remove_version(handle, LogicalTimestamp::INF);
        unsafe { slab.release(removed) };

        let v = table.get_version(3, LogicalTimestamp::new(9, 0)).unwrap();
        assert_eq!(v.value, 0);
    }
}
