//! End-to-end scenarios from spec.md §8 that exercise the full stack:
//! engine orchestration, the worker pool, and the durable log together.
//!
//! Scenarios 1–3 (single insert/read, write–write conflict, commit
//! dependency) are exercised directly against `chronodb-txn`'s `Worker` in
//! that crate's own unit tests, since they need no log or engine wiring.
//! The scenarios here need the pieces only the facade assembles: restore,
//! read-only elision at the log stage, and cross-worker fanout.

use std::io::{self, Read, Write};

use chronodb::{Engine, EngineConfig, LogicalTimestamp, Transaction, TransactionRegistry, TxnContext};

const TABLE: u32 = 1;

/// Read-modify-write: add `delta` to the `i64` stored at `key`.
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

/// A read-only lookup that touches the log only if it were (wrongly) framed.
struct Peek {
    key: u64,
}

impl Transaction for Peek {
    fn type_id(&self) -> u32 {
        2
    }

    fn is_readonly(&self) -> bool {
        true
    }

    fn now_phase(&mut self, ctx: &mut TxnContext<'_>) -> bool {
        ctx.read(TABLE, self.key).is_ok()
    }

    fn serialize(&self, _writer: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
}

fn peek_factory(_reader: &mut dyn Read) -> io::Result<Box<dyn Transaction>> {
    unreachable!("read-only transactions are never logged, so never replayed")
}

fn registry() -> TransactionRegistry {
    let mut registry = TransactionRegistry::new();
    registry.register(1, increment_factory);
    registry.register(2, peek_factory);
    registry
}

/// Scenario 4: log replay. Run a batch of 100 non-read-only transactions,
/// then restart against the same log with an empty database and
/// `allow_restore=true`. The restored state matches the original run.
#[test]
fn log_replay_reproduces_original_state() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("chronodb.log");
    let registry = registry();

    {
        let config = EngineConfig::builder().table(TABLE, 200, 8).num_workers(4).log_path(&log_path).build();
        let mut engine = Engine::open(config, &registry);
        let batch: Vec<Box<dyn Transaction>> =
            (0..100).map(|k| Box::new(Increment { key: k, delta: (k as i64) + 1 }) as Box<dyn Transaction>).collect();
        let outcome = engine.submit_batch(batch);
        assert_eq!(outcome.committed, 100);
        assert_eq!(outcome.aborted, 0);
    }

    let config =
        EngineConfig::builder().table(TABLE, 200, 8).num_workers(4).log_path(&log_path).allow_restore(true).build();
    let engine = Engine::open(config, &registry);

    for k in 0..100u64 {
        let node = engine.tables().get(&TABLE).unwrap().get_version(k, LogicalTimestamp::INF).unwrap();
        let value = i64::from_le_bytes(node.value[..8].try_into().unwrap());
        assert_eq!(value, (k as i64) + 1);
    }
}

/// Scenario 5: read-only elision. A batch of 50 transactions, 20 read-only,
/// 30 writes. The log file's length equals the sum of the serialized sizes
/// of just the 30 write transactions, each framed as `[u32 type][u64
/// length][body]`.
#[test]
fn read_only_transactions_are_elided_from_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("chronodb.log");
    let registry = registry();

    let config = EngineConfig::builder().table(TABLE, 100, 8).num_workers(1).log_path(&log_path).build();
    let mut engine = Engine::open(config, &registry);

    let mut batch: Vec<Box<dyn Transaction>> = Vec::new();
    let mut expected_len: u64 = 0;
    for k in 0..50u64 {
        if k % 5 == 0 || k % 5 == 1 {
            // 2 of every 5 (20 of 50) are read-only.
            batch.push(Box::new(Peek { key: k }));
        } else {
            batch.push(Box::new(Increment { key: k, delta: 1 }));
            // [u32 type] + [u64 length] + body (8 bytes key + 8 bytes delta).
            expected_len += 4 + 8 + 16;
        }
    }

    let outcome = engine.submit_batch(batch);
    assert_eq!(outcome.committed, 50);
    assert_eq!(outcome.aborted, 0);

    let on_disk = std::fs::metadata(&log_path).unwrap().len();
    assert_eq!(on_disk, expected_len);
}

/// A batch split across workers produces start/commit timestamps that
/// interleave correctly across slices: every key gets exactly the one write
/// its own slice's worker assigned it, regardless of how many workers ran
/// concurrently.
///
/// Scenario 6 (cross-worker commit-dependency propagation) needs a writer
/// and a reader to touch the same key while the writer is still PREPARING.
/// Within a single batch that can't happen here (batches are snapshot
/// isolated from each other by timestamp construction — see
/// `chronodb_txn::worker`'s module tests for why), so that scenario is
/// exercised directly against `Worker` in that crate, where the PREPARING
/// state can be held open deterministically instead of raced against real
/// thread scheduling.
#[test]
fn multi_worker_batch_assigns_disjoint_keys_consistently() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();

    let config =
        EngineConfig::builder().table(TABLE, 100, 8).num_workers(4).log_path(dir.path().join("chronodb.log")).build();
    let mut engine = Engine::open(config, &registry);

    let batch: Vec<Box<dyn Transaction>> =
        (0..40).map(|k| Box::new(Increment { key: k, delta: (k as i64) * 2 + 1 }) as Box<dyn Transaction>).collect();
    let outcome = engine.submit_batch(batch);
    assert_eq!(outcome.committed, 40);
    assert_eq!(outcome.aborted, 0);

    for k in 0..40u64 {
        let node = engine.tables().get(&TABLE).unwrap().get_version(k, LogicalTimestamp::INF).unwrap();
        assert_eq!(i64::from_le_bytes(node.value[..8].try_into().unwrap()), (k as i64) * 2 + 1);
    }
}
