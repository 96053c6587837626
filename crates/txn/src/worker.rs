//! One CPU-pinned worker's batch execution loop (spec.md §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use chronodb_core::{LogicalTimestamp, TxnCell, TxnState};
use chronodb_table::{RecordHandle, RecordSlab, VersionBufferAllocator, VersionedTable};
use tracing::{debug, trace};

use crate::context::TxnContext;
use crate::dependency::{CommitFanout, DepMessage, DepOutcome, DependencySet};
use crate::transaction::{RecordBytes, Transaction};

/// A table registry shared (read-only, for table structure) across every
/// worker: each `VersionedTable` internally serializes writers via its own
/// slot latches, so sharing the registry by reference is safe.
pub type TableRegistry = HashMap<u32, VersionedTable<RecordBytes>>;

/// One in-flight transaction this worker owns, between the end of its
/// now-phase and its terminal state.
struct InFlight {
    global_index: u32,
    cell: Arc<TxnCell>,
    commit_ts: LogicalTimestamp,
    pending_writes: Vec<(u32, RecordHandle<RecordBytes>)>,
    deps: DependencySet,
}

/// Outcome of one executed slice: counts plus the global (whole-batch)
/// indices of the transactions that committed, ascending. The log stage
/// serializes committed transactions in this order (spec.md §4.4: "in
/// commit order" — resolved as `(epoch, intra_batch_index)` array order,
/// spec.md §5).
#[derive(Debug, Default, Clone)]
pub struct BatchOutcome {
    pub committed: usize,
    pub aborted: usize,
    pub committed_global_indices: Vec<u32>,
}

/// Everything one worker owns for the lifetime of the engine: its id, its
/// per-table record slabs, and its version-buffer allocator (spec.md §5:
/// "per-thread, not shared").
pub struct Worker {
    pub id: usize,
    slabs: HashMap<u32, RecordSlab<RecordBytes>>,
    allocator: VersionBufferAllocator,
    fanout: CommitFanout,
    commit_rx: crossbeam_channel::Receiver<DepMessage>,
}

impl Worker {
    pub fn new(
        id: usize,
        table_ids: impl IntoIterator<Item = u32>,
        version_buffer_capacity_bytes: usize,
        fanout: CommitFanout,
        commit_rx: crossbeam_channel::Receiver<DepMessage>,
    ) -> Self {
        let mut slabs = HashMap::new();
        for table_id in table_ids {
            slabs.insert(table_id, RecordSlab::new());
        }
        Worker { id, slabs, allocator: VersionBufferAllocator::new(version_buffer_capacity_bytes), fanout, commit_rx }
    }

    /// Resolve `cell`'s terminal state and notify every worker with a
    /// registered dependent (spec.md §4.3: "W, upon finalization, posts
    /// (W.id, outcome) to each dependent's home worker").
    fn resolve_and_notify(&self, cell: &TxnCell, outcome: DepOutcome) {
        match outcome {
            DepOutcome::Committed => cell.mark_committed(),
            DepOutcome::Aborted => cell.mark_aborted(),
        }
        for (home_worker, dependent_txn_id) in cell.take_dependents() {
            self.fanout.notify(home_worker, DepMessage { dependent_txn_id, outcome });
        }
    }

    /// Drain every queued notification, applying it to the in-flight
    /// transaction it targets, if still tracked.
    fn drain_commit_queue(&self, in_flight: &mut HashMap<u64, InFlight>) {
        while let Ok(msg) = self.commit_rx.try_recv() {
            if let Some(entry) = in_flight.get_mut(&msg.dependent_txn_id) {
                entry.deps.resolve(msg.outcome);
            }
        }
    }

    /// Execute `slice`, this worker's contiguous portion of a batch, against
    /// `tables`. `base_index` is `slice`'s offset within the full batch and
    /// `total_len` the full batch's length: both feed the `(epoch,
    /// intra_batch_index)` timestamp assignment so that every worker
    /// processing a disjoint slice of the same batch produces start/commit
    /// timestamps that interleave correctly with its peers' (spec.md §4.3:
    /// "each worker owns one CPU and processes a contiguous slice of the
    /// input batch"). A single-worker caller passes `base_index = 0`,
    /// `total_len = slice.len()`.
    ///
    /// This is the reference (non-pipelined) executor; `crate::piece`
    /// implements the intra-transaction-parallel variant over the same
    /// `TxnContext` surface.
    pub fn run_batch(
        &mut self,
        slice: &mut [Box<dyn Transaction>],
        epoch: u32,
        base_index: u32,
        total_len: u32,
        tables: &TableRegistry,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut in_flight: HashMap<u64, InFlight> = HashMap::with_capacity(slice.len());

        // Phase 1 (now-phase): run every transaction's body, assigning
        // commit timestamps to those that succeed. A transaction's commit
        // timestamp strictly exceeds every start timestamp in the batch.
        for (idx, txn) in slice.iter_mut().enumerate() {
            let txn_id = idx as u64;
            let start_ts = LogicalTimestamp::new(epoch, base_index + idx as u32);
            let cell = Arc::new(TxnCell::new_active());
            let mut ctx = TxnContext::new(self.id, txn_id, start_ts, Arc::clone(&cell), tables, &mut self.slabs, &mut self.allocator);

            let now_ok = txn.now_phase(&mut ctx) && !ctx.is_aborted();
            let dep_count = ctx.dependencies.len() as u32;
            let pending_writes = ctx.finish_now_phase();

            if !now_ok {
                debug!(worker = self.id, txn = txn_id, "now-phase failed");
                TxnContext::discard(tables, &mut self.slabs, pending_writes);
                self.resolve_and_notify(&cell, DepOutcome::Aborted);
                outcome.aborted += 1;
                continue;
            }

            let commit_ts = LogicalTimestamp::new(epoch, total_len + base_index + idx as u32);
            cell.mark_preparing(commit_ts);

            let mut deps = DependencySet::new();
            for _ in 0..dep_count {
                deps.add();
            }
            let global_index = base_index + idx as u32;
            in_flight.insert(txn_id, InFlight { global_index, cell, commit_ts, pending_writes, deps });
        }

        // Phase 2 (later-phase): resolve commit dependencies. Every
        // dependency a transaction took in phase 1 points at a writer whose
        // cell is, at worst, already PREPARING by the time we reach this
        // loop (same-batch writers resolve in phase 1 order above;
        // cross-batch/cross-worker writers deliver their outcome
        // asynchronously via `commit_rx`, drained here between
        // transactions, spec.md §4.3).
        let mut remaining: Vec<u64> = in_flight.keys().copied().collect();
        while !remaining.is_empty() {
            self.drain_commit_queue(&mut in_flight);
            let mut still_waiting = Vec::new();
            let mut resolved_any = false;
            for txn_id in remaining.drain(..) {
                let satisfied = {
                    let entry = in_flight.get(&txn_id).expect("in-flight entry vanished");
                    entry.deps.is_satisfied() || entry.deps.is_aborted()
                };
                if !satisfied {
                    still_waiting.push(txn_id);
                    continue;
                }
                resolved_any = true;
                let entry = in_flight.remove(&txn_id).expect("in-flight entry vanished");
                if entry.deps.is_aborted() {
                    TxnContext::discard(tables, &mut self.slabs, entry.pending_writes);
                    self.resolve_and_notify(&entry.cell, DepOutcome::Aborted);
                    outcome.aborted += 1;
                    trace!(worker = self.id, txn = txn_id, "aborted via commit dependency");
                } else {
                    TxnContext::finalize(tables, entry.pending_writes, entry.commit_ts);
                    self.resolve_and_notify(&entry.cell, DepOutcome::Committed);
                    outcome.committed += 1;
                    outcome.committed_global_indices.push(entry.global_index);
                }
            }
            remaining = still_waiting;
            if remaining.is_empty() {
                break;
            }
            if !resolved_any {
                // No locally-resolvable dependency and the queue was empty:
                // block until a remote worker's notification arrives rather
                // than busy-spin (spec.md §5 reserves busy-waiting for the
                // bounded slot latch, not cross-worker dependency delivery).
                if let Ok(msg) = self.commit_rx.recv() {
                    if let Some(entry) = in_flight.get_mut(&msg.dependent_txn_id) {
                        entry.deps.resolve(msg.outcome);
                    }
                }
            }
        }

        outcome.committed_global_indices.sort_unstable();
        outcome
    }

    /// This worker's notification outbox, shared with the engine's wiring so
    /// remote workers (driven on real OS threads) can be reached directly.
    pub fn fanout(&self) -> &CommitFanout {
        &self.fanout
    }
}

/// True once a `TxnCell`'s state has resolved to a terminal outcome.
pub fn terminal_outcome(cell: &TxnCell) -> Option<DepOutcome> {
    let (state, _) = cell.load(std::sync::atomic::Ordering::Acquire);
    match state {
        TxnState::Committed => Some(DepOutcome::Committed),
        TxnState::Aborted => Some(DepOutcome::Aborted),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};

    const TABLE: u32 = 1;

    struct Increment {
        key: u64,
        delta: i64,
        fail: bool,
    }

    impl Transaction for Increment {
        fn type_id(&self) -> u32 {
            1
        }

        fn now_phase(&mut self, ctx: &mut TxnContext<'_>) -> bool {
            if self.fail {
                return false;
            }
            let current = ctx
                .read(TABLE, self.key)
                .unwrap()
                .map(|bytes| i64::from_le_bytes(bytes[..8].try_into().unwrap()))
                .unwrap_or(0);
            let next = (current + self.delta).to_le_bytes().to_vec().into_boxed_slice();
            ctx.write(TABLE, self.key, next).is_ok()
        }

        fn serialize(&self, writer: &mut dyn Write) -> io::Result<()> {
            writer.write_all(&self.key.to_le_bytes())?;
            writer.write_all(&self.delta.to_le_bytes())
        }
    }

    // The init slab must outlive every test's `TableRegistry`: the table's
    // slots hold raw pointers into its boxed nodes.
    fn fresh_registry(num_records: usize) -> (TableRegistry, RecordSlab<RecordBytes>) {
        let mut tables = TableRegistry::new();
        let table = VersionedTable::new(TABLE, num_records);
        let mut slab = RecordSlab::new();
        for k in 0..num_records as u64 {
            table.force_insert(&mut slab, k, vec![0u8; 8].into_boxed_slice());
        }
        table.finish_init();
        tables.insert(TABLE, table);
        (tables, slab)
    }

    fn lone_worker() -> Worker {
        let (fanout, mut rxs) = crate::dependency::commit_queues(1, 64);
        Worker::new(0, [TABLE], 4096, fanout, rxs.pop().unwrap())
    }

    fn read_value(tables: &TableRegistry, key: u64, ts: LogicalTimestamp) -> i64 {
        let node = tables.get(&TABLE).unwrap().get_version(key, ts).unwrap();
        i64::from_le_bytes(node.value[..8].try_into().unwrap())
    }

    #[test]
    fn single_insert_single_read() {
        let (tables, _slab) = fresh_registry(1000);
        let mut worker = lone_worker();
        let mut batch: Vec<Box<dyn Transaction>> = vec![Box::new(Increment { key: 42, delta: 1, fail: false })];
        let outcome = worker.run_batch(&mut batch, 1, 0, batch.len() as u32, &tables);
        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.aborted, 0);
        assert_eq!(read_value(&tables, 42, LogicalTimestamp::new(2, 0)), 1);
    }

    #[test]
    fn write_write_conflict_one_loser() {
        let (tables, _slab) = fresh_registry(100);
        let mut worker = lone_worker();
        let mut batch: Vec<Box<dyn Transaction>> = vec![
            Box::new(Increment { key: 7, delta: 10, fail: false }),
            Box::new(Increment { key: 7, delta: 20, fail: false }),
        ];
        let outcome = worker.run_batch(&mut batch, 1, 0, batch.len() as u32, &tables);
        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.aborted, 1);
    }

    #[test]
    fn now_phase_failure_aborts_without_touching_table() {
        let (tables, _slab) = fresh_registry(10);
        let mut worker = lone_worker();
        let mut batch: Vec<Box<dyn Transaction>> = vec![Box::new(Increment { key: 3, delta: 5, fail: true })];
        let outcome = worker.run_batch(&mut batch, 1, 0, batch.len() as u32, &tables);
        assert_eq!(outcome.aborted, 1);
        assert_eq!(read_value(&tables, 3, LogicalTimestamp::new(2, 0)), 0);
    }

    #[test]
    fn batch_of_independent_writes_all_commit() {
        let (tables, _slab) = fresh_registry(50);
        let mut worker = lone_worker();
        let mut batch: Vec<Box<dyn Transaction>> = (0..10)
            .map(|k| Box::new(Increment { key: k, delta: 1, fail: false }) as Box<dyn Transaction>)
            .collect();
        let outcome = worker.run_batch(&mut batch, 1, 0, batch.len() as u32, &tables);
        assert_eq!(outcome.committed, 10);
        assert_eq!(outcome.aborted, 0);
    }

    /// A read-only transaction that signals `ready_tx` once it has taken its
    /// commit dependency, so the test can drive the writer's resolution only
    /// after the dependency is actually registered.
    struct DependentReader {
        key: u64,
        ready_tx: crossbeam_channel::Sender<()>,
    }

    impl Transaction for DependentReader {
        fn type_id(&self) -> u32 {
            99
        }

        fn is_readonly(&self) -> bool {
            true
        }

        fn now_phase(&mut self, ctx: &mut TxnContext<'_>) -> bool {
            let _ = ctx.read(TABLE, self.key);
            let _ = self.ready_tx.send(());
            true
        }

        fn serialize(&self, _writer: &mut dyn Write) -> io::Result<()> {
            Ok(())
        }
    }

    /// Scenario 6 (spec.md §8): a writer on one worker reaches PREPARING and
    /// stays there; a reader on a different worker observes it, takes a
    /// commit dependency, and only finalizes once the writer's outcome
    /// arrives over the commit queue.
    ///
    /// Built by hand rather than through two `run_batch` calls: within one
    /// engine batch, every commit timestamp is assigned strictly after every
    /// start timestamp (see `run_batch`'s phase 1), so no reader in the same
    /// batch can ever observe another same-batch writer as still pending —
    /// batches are snapshot-isolated from each other by construction. A
    /// cross-batch race exists only when a pipeline overlaps batches, which
    /// this crate's synchronous, per-batch `Engine::submit_batch` does not
    /// do. This test reproduces the dependency state directly to exercise
    /// the commit-queue plumbing that a future overlapping pipeline would
    /// rely on.
    #[test]
    fn cross_worker_dependency_resolves_via_commit_queue() {
        let (tables, _slab) = fresh_registry(50);

        let cell = Arc::new(TxnCell::new_active());
        let mut writer_slab: RecordSlab<RecordBytes> = RecordSlab::new();
        let value: RecordBytes = 7i64.to_le_bytes().to_vec().into_boxed_slice();
        let ptr = chronodb_table::begin_write(&cell, 9, value, &mut writer_slab);
        let _handle = tables.get(&TABLE).unwrap().insert_version(9, ptr).unwrap();
        cell.mark_preparing(LogicalTimestamp::new(0, 0));

        let (fanout, mut rxs) = crate::dependency::commit_queues(2, 8);
        let commit_rx_b = rxs.pop().unwrap();
        let mut worker_b = Worker::new(1, [TABLE], 4096, fanout.clone(), commit_rx_b);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let mut batch: Vec<Box<dyn Transaction>> = vec![Box::new(DependentReader { key: 9, ready_tx })];

        let outcome = std::thread::scope(|scope| {
            let join = scope.spawn(|| worker_b.run_batch(&mut batch, 1, 0, 1, &tables));

            ready_rx.recv().expect("reader registered its dependency before signaling");
            cell.mark_committed();
            for (home_worker, dependent_txn_id) in cell.take_dependents() {
                fanout.notify(home_worker, DepMessage { dependent_txn_id, outcome: DepOutcome::Committed });
            }

            join.join().expect("worker thread panicked")
        });

        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.aborted, 0);
    }
}
