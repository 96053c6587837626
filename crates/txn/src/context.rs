//! The read/write surface a transaction body sees during now-phase
//! (spec.md §4.2, §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use chronodb_core::{CompositeKey, Error, FieldValue, LogicalTimestamp, Result, TxnCell};
use chronodb_table::{begin_write, RecordHandle, RecordSlab, VersionBuffer, VersionBufferAllocator, VersionedTable};

use crate::transaction::RecordBytes;

/// One pending write this transaction has installed but not yet finalized
/// or removed.
struct PendingWrite {
    table_id: u32,
    handle: RecordHandle<RecordBytes>,
}

/// Per-transaction state threaded through `now_phase`/`later_phase`: the
/// read/write surface, the accumulated read-set buffer, and the commit
/// dependencies taken along the way.
pub struct TxnContext<'w> {
    pub(crate) worker_id: usize,
    pub(crate) txn_id: u64,
    pub(crate) start_ts: LogicalTimestamp,
    pub(crate) cell: Arc<TxnCell>,
    tables: &'w HashMap<u32, VersionedTable<RecordBytes>>,
    slabs: &'w mut HashMap<u32, RecordSlab<RecordBytes>>,
    allocator: &'w mut VersionBufferAllocator,
    read_set: VersionBuffer,
    pending_writes: Vec<PendingWrite>,
    pub(crate) dependencies: Vec<Arc<TxnCell>>,
    aborted: bool,
}

impl<'w> TxnContext<'w> {
    pub(crate) fn new(
        worker_id: usize,
        txn_id: u64,
        start_ts: LogicalTimestamp,
        cell: Arc<TxnCell>,
        tables: &'w HashMap<u32, VersionedTable<RecordBytes>>,
        slabs: &'w mut HashMap<u32, RecordSlab<RecordBytes>>,
        allocator: &'w mut VersionBufferAllocator,
    ) -> Self {
        TxnContext {
            worker_id,
            txn_id,
            start_ts,
            cell,
            tables,
            slabs,
            allocator,
            read_set: VersionBuffer::new(),
            pending_writes: Vec::new(),
            dependencies: Vec::new(),
            aborted: false,
        }
    }

    /// This transaction's start timestamp.
    pub fn start_ts(&self) -> LogicalTimestamp {
        self.start_ts
    }

    /// Read the version of `(table_id, key)` valid at this transaction's
    /// start timestamp. Recording a dependency happens transparently if the
    /// observed version is still pending (spec.md §4.2 step 4).
    pub fn read(&mut self, table_id: u32, key: u64) -> Result<Option<&RecordBytes>> {
        let table = self
            .tables
            .get(&table_id)
            .ok_or_else(|| Error::ConfigInvalid(format!("unknown table {table_id}")))?;

        let Some(record) = table.get_version(key, self.start_ts) else {
            return Ok(None);
        };

        if let FieldValue::TxnRef(owner) = record.begin.load(std::sync::atomic::Ordering::Acquire) {
            owner.register_dependent(self.worker_id, self.txn_id);
            self.dependencies.push(owner);
        }

        self.read_set
            .record(self.allocator, CompositeKey::new(table_id, key))
            .map_err(|e| {
                self.aborted = true;
                e
            })?;

        Ok(Some(&record.value))
    }

    /// Install a tentative write, tagged with this transaction's own state
    /// cell (spec.md §4.2 `insert_version`). On a latch conflict, marks this
    /// transaction for abort and propagates `WriteConflict`.
    pub fn write(&mut self, table_id: u32, key: u64, value: RecordBytes) -> Result<()> {
        let table = self
            .tables
            .get(&table_id)
            .ok_or_else(|| Error::ConfigInvalid(format!("unknown table {table_id}")))?;
        let slab = self
            .slabs
            .get_mut(&table_id)
            .ok_or_else(|| Error::ConfigInvalid(format!("no slab for table {table_id}")))?;

        let ptr = begin_write(&self.cell, key, value, slab);
        match table.insert_version(key, ptr) {
            Ok(handle) => {
                self.pending_writes.push(PendingWrite { table_id, handle });
                Ok(())
            }
            Err(e) => {
                // SAFETY: `ptr` was just allocated by `slab` above and was
                // never linked into a slot (insert_version rejected it).
                unsafe { slab.release(ptr) };
                self.aborted = true;
                Err(e)
            }
        }
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// End of now-phase: release the read-set buffer (its job — taking
    /// commit dependencies on observed pending versions — is already done)
    /// and hand the pending writes back to the worker, unresolved. The
    /// worker holds these until the transaction's commit dependencies
    /// resolve, then calls `finalize` or `discard` (spec.md §4.2: `begin`
    /// stays a transaction reference, tagged PREPARING, until then).
    pub(crate) fn finish_now_phase(mut self) -> Vec<(u32, RecordHandle<RecordBytes>)> {
        self.read_set.release(self.allocator);
        self.pending_writes.drain(..).map(|pw| (pw.table_id, pw.handle)).collect()
    }

    /// Commit path, invoked by the worker once every dependency resolves to
    /// committed: stamp every pending write with `commit_ts` (spec.md §4.2
    /// `finalize_version`).
    pub(crate) fn finalize(
        tables: &HashMap<u32, VersionedTable<RecordBytes>>,
        pending: Vec<(u32, RecordHandle<RecordBytes>)>,
        commit_ts: LogicalTimestamp,
    ) {
        for (table_id, handle) in pending {
            let table = tables.get(&table_id).expect("table vanished between write and finalize");
            table.finalize_version(handle, commit_ts);
        }
    }

    /// Abort path: unlink every pending write and return its memory to
    /// `slabs` (spec.md §4.2 `remove_version`). Used both for an immediate
    /// now-phase failure and for a later dependency-triggered abort.
    pub(crate) fn discard(
        tables: &HashMap<u32, VersionedTable<RecordBytes>>,
        slabs: &mut HashMap<u32, RecordSlab<RecordBytes>>,
        pending: Vec<(u32, RecordHandle<RecordBytes>)>,
    ) {
        for (table_id, handle) in pending {
            let table = tables.get(&table_id).expect("table vanished between write and discard");
            let slab = slabs.get_mut(&table_id).expect("slab vanished between write and discard");
            let released = table.remove_version(handle, LogicalTimestamp::INF);
            // SAFETY: `remove_version` just unlinked this node from its slot.
            unsafe { slab.release(released) };
        }
    }
}
