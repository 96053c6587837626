//! Orchestration: builds the table registry, wires worker commit-fanout
//! queues, drives restore-then-live batch execution, and hands committed
//! batches to the log stage (spec.md §4.3, §4.5, §4.6).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chronodb_core::Result;
use chronodb_log::{open_for_restore, replay, LogWriter};
use chronodb_table::{RecordSlab, VersionedTable};
use chronodb_txn::{commit_queues, BatchOutcome, TableRegistry, Transaction, TransactionRegistry, Worker};
use tracing::{error, info, info_span};

use crate::config::EngineConfig;

/// The running engine: owns the shared table registry, the durable log
/// writer, and one `Worker` per configured thread.
///
/// Workers are addressed by array index, not by a consistent-hash ring
/// (spec.md §9).
pub struct Engine {
    config: EngineConfig,
    tables: Arc<TableRegistry>,
    // Never read after construction: kept alive because each table's slots
    // hold raw pointers into these nodes (chronodb_table::table::force_insert).
    _init_slabs: Vec<RecordSlab<chronodb_txn::RecordBytes>>,
    workers: Vec<Worker>,
    log: LogWriter,
    next_epoch: AtomicU32,
}

/// Tally returned by [`Engine::submit_batch`]: per-worker-slice commit/abort
/// counts, summed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubmitOutcome {
    pub committed: usize,
    pub aborted: usize,
}

impl Engine {
    /// Build the table registry, optionally replay the durable log into it
    /// (spec.md §4.5), and spawn one `Worker` per configured thread.
    ///
    /// `registry` supplies the transaction-type deserializers recovery needs;
    /// it plays no role once restore completes.
    ///
    /// Does not return `Result`: per spec.md §7, a failure to open or replay
    /// the durable log is unrecoverable and terminates the process after
    /// logging, rather than propagating to the caller.
    pub fn open(config: EngineConfig, registry: &TransactionRegistry) -> Self {
        let mut tables = TableRegistry::new();
        let mut init_slabs = Vec::with_capacity(config.tables().len());
        for table in config.tables() {
            let versioned = VersionedTable::new(table.table_id, table.num_records);
            let mut init_slab = RecordSlab::new();
            let zero = vec![0u8; table.record_size].into_boxed_slice();
            for key in 0..table.num_records as u64 {
                versioned.force_insert(&mut init_slab, key, zero.clone());
            }
            versioned.finish_init();
            init_slabs.push(init_slab);
            tables.insert(table.table_id, versioned);
        }
        let tables = Arc::new(tables);

        let (fanout, mut commit_rxs) = commit_queues(config.num_workers(), config.queue_capacity());
        let mut workers = Vec::with_capacity(config.num_workers());
        for id in 0..config.num_workers() {
            let table_ids = config.tables().iter().map(|t| t.table_id).collect::<Vec<_>>();
            workers.push(Worker::new(
                id,
                table_ids,
                config.version_buffer_capacity_bytes(),
                fanout.clone(),
                commit_rxs.remove(0),
            ));
        }

        let mut next_epoch = config.starting_epoch();
        if config.allow_restore() {
            if let Some(file) = exit_on_fatal(open_for_restore(config.log_path()), "opening log for restore") {
                let span = info_span!("restore");
                let _enter = span.enter();
                let mut restored_batches = 0u64;
                let outcome = replay(file, registry, config.batch_size(), config.starting_epoch(), |batch| {
                    run_restored_batch(&mut workers, &tables, batch.epoch, batch.transactions);
                    restored_batches += 1;
                    next_epoch = batch.epoch + 1;
                });
                exit_on_fatal(outcome, "replaying durable log");
                info!(restored_batches, "restore complete");
            }
        }

        let log = exit_on_fatal(LogWriter::open(config.log_path()), "opening durable log");
        Engine { config, tables, _init_slabs: init_slabs, workers, log, next_epoch: AtomicU32::new(next_epoch) }
    }

    /// Execute one batch: split across workers, run in parallel, log the
    /// committed (non-read-only) transactions in original array order, and
    /// return the tally (spec.md §4.3, §4.4).
    ///
    /// Infallible for the same reason [`Engine::open`] is: a durable-log
    /// write failure is fatal and exits the process rather than returning.
    pub fn submit_batch(&mut self, mut batch: Vec<Box<dyn Transaction>>) -> SubmitOutcome {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let total_len = batch.len() as u32;
        let span = info_span!("batch", epoch, total_len);
        let _enter = span.enter();

        let outcomes = run_batch_over_workers(&mut self.workers, &self.tables, epoch, &mut batch);

        let mut committed_indices: Vec<u32> = outcomes.iter().flat_map(|o| o.committed_global_indices.iter().copied()).collect();
        committed_indices.sort_unstable();

        let to_log: Vec<Box<dyn Transaction>> =
            committed_indices.into_iter().map(|idx| std::mem::replace(&mut batch[idx as usize], placeholder())).collect();
        exit_on_fatal(self.log.append_batch(&to_log), "writing batch to durable log");

        let mut tally = SubmitOutcome::default();
        for o in &outcomes {
            tally.committed += o.committed;
            tally.aborted += o.aborted;
        }
        tally
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The live table registry. Exposed for read-only inspection (tests,
    /// diagnostics); normal reads happen inside a transaction's `now_phase`
    /// via `TxnContext::read`.
    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }
}

/// Split `batch` into `workers.len()` contiguous slices and run each on its
/// own OS thread (spec.md §4.3: "each worker owns one CPU and processes a
/// contiguous slice of the input batch").
fn run_batch_over_workers(
    workers: &mut [Worker],
    tables: &TableRegistry,
    epoch: u32,
    batch: &mut [Box<dyn Transaction>],
) -> Vec<BatchOutcome> {
    let total_len = batch.len() as u32;
    if workers.len() == 1 {
        return vec![workers[0].run_batch(batch, epoch, 0, total_len, tables)];
    }

    let chunk_size = batch.len().div_ceil(workers.len());
    let mut slices: Vec<&mut [Box<dyn Transaction>]> = Vec::with_capacity(workers.len());
    let mut rest = batch;
    let mut base = 0u32;
    let mut bases = Vec::with_capacity(workers.len());
    while !rest.is_empty() {
        let take = chunk_size.min(rest.len());
        let (head, tail) = rest.split_at_mut(take);
        slices.push(head);
        bases.push(base);
        base += take as u32;
        rest = tail;
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = workers
            .iter_mut()
            .zip(slices.into_iter())
            .zip(bases.into_iter())
            .map(|((worker, slice), base_index)| {
                scope.spawn(move || worker.run_batch(slice, epoch, base_index, total_len, tables))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("worker thread panicked")).collect()
    })
}

/// Run one restored batch against the live tables without re-logging it
/// (spec.md §4.5 step 4: "enqueued on the downstream queue exactly as if it
/// had come through normal execution" — here, executed directly since the
/// durable log is already the source of truth for these transactions).
fn run_restored_batch(workers: &mut [Worker], tables: &TableRegistry, epoch: u32, mut transactions: Vec<Box<dyn Transaction>>) {
    run_batch_over_workers(workers, tables, epoch, &mut transactions);
}

/// Unwrap a durable-log result, or log and terminate the process.
///
/// Every caller of this function only ever passes `Error::IoFailure` or
/// `Error::LogCorruption` (spec.md §7): both are unrecoverable once the
/// synchronous-durability contract is broken, so continuing risks silent
/// data loss.
fn exit_on_fatal<T>(result: Result<T>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            error!(%err, context, "unrecoverable log failure, terminating");
            std::process::exit(1);
        }
    }
}

/// A dummy, always-aborting transaction used to vacate a logged slot in
/// `batch` without cloning its payload.
fn placeholder() -> Box<dyn Transaction> {
    struct Placeholder;
    impl Transaction for Placeholder {
        fn type_id(&self) -> u32 {
            0
        }
        fn now_phase(&mut self, _ctx: &mut chronodb_txn::TxnContext<'_>) -> bool {
            false
        }
        fn serialize(&self, _writer: &mut dyn std::io::Write) -> std::io::Result<()> {
            Ok(())
        }
    }
    Box::new(Placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronodb_core::LogicalTimestamp;
    use chronodb_txn::TxnContext;
    use std::io::{self, Read, Write};
    use tempfile::tempdir;

    const TABLE: u32 = 1;

    struct Increment {
        key: u64,
        delta: i64,
    }

    impl Transaction for Increment {
        fn type_id(&self) -> u32 {
            1
        }

        fn now_phase(&mut self, ctx: &mut TxnContext<'_>) -> bool {
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

    fn increment_factory(reader: &mut dyn Read) -> io::Result<Box<dyn Transaction>> {
        let mut key_bytes = [0u8; 8];
        let mut delta_bytes = [0u8; 8];
        reader.read_exact(&mut key_bytes)?;
        reader.read_exact(&mut delta_bytes)?;
        Ok(Box::new(Increment { key: u64::from_le_bytes(key_bytes), delta: i64::from_le_bytes(delta_bytes) }))
    }

    fn registry() -> TransactionRegistry {
        let mut registry = TransactionRegistry::new();
        registry.register(1, increment_factory);
        registry
    }

    #[test]
    fn single_worker_batch_commits_and_logs() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::builder()
            .table(TABLE, 100, 8)
            .num_workers(1)
            .log_path(dir.path().join("chronodb.log"))
            .build();
        let registry = registry();
        let mut engine = Engine::open(config, &registry);

        let batch: Vec<Box<dyn Transaction>> = vec![Box::new(Increment { key: 3, delta: 5 })];
        let outcome = engine.submit_batch(batch);
        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.aborted, 0);

        let metadata = std::fs::metadata(config_log_path(&engine)).unwrap();
        assert!(metadata.len() > 0);

        let node = engine.tables.get(&TABLE).unwrap().get_version(3, LogicalTimestamp::INF).unwrap();
        assert_eq!(i64::from_le_bytes(node.value[..8].try_into().unwrap()), 5);
    }

    #[test]
    fn multi_worker_batch_splits_across_slices() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::builder()
            .table(TABLE, 100, 8)
            .num_workers(4)
            .log_path(dir.path().join("chronodb.log"))
            .build();
        let registry = registry();
        let mut engine = Engine::open(config, &registry);

        let batch: Vec<Box<dyn Transaction>> =
            (0..20).map(|k| Box::new(Increment { key: k, delta: 1 }) as Box<dyn Transaction>).collect();
        let outcome = engine.submit_batch(batch);
        assert_eq!(outcome.committed, 20);
        assert_eq!(outcome.aborted, 0);
    }

    #[test]
    fn restore_replays_prior_batches_into_fresh_tables() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("chronodb.log");
        let registry = registry();

        {
            let config = EngineConfig::builder().table(TABLE, 100, 8).log_path(&log_path).build();
            let mut engine = Engine::open(config, &registry);
            for k in 0..5u64 {
                engine.submit_batch(vec![Box::new(Increment { key: k, delta: 7 })]);
            }
        }

        let config = EngineConfig::builder().table(TABLE, 100, 8).log_path(&log_path).allow_restore(true).build();
        let engine = Engine::open(config, &registry);
        for k in 0..5u64 {
            let node = engine.tables.get(&TABLE).unwrap().get_version(k, LogicalTimestamp::INF).unwrap();
            assert_eq!(i64::from_le_bytes(node.value[..8].try_into().unwrap()), 7);
        }
    }

    fn config_log_path(engine: &Engine) -> &std::path::Path {
        engine.config().log_path()
    }
}
