//! The transaction contract external collaborators implement (spec.md §6).

use std::io::{self, Read, Write};

use crate::context::TxnContext;

/// A table's record payload. Opaque and fixed-size per table by convention
/// of the caller (spec.md §3: "a fixed-size opaque value payload,
/// schema-defined per table"); the core never interprets the bytes.
pub type RecordBytes = Box<[u8]>;

/// Capability set every transaction type must provide (spec.md §6).
///
/// Object-safe so workers can hold a heterogeneous `Vec<Box<dyn Transaction>>`
/// per batch without knowing concrete transaction types.
pub trait Transaction: Send {
    /// A stable, registered, non-zero type id used to frame and dispatch
    /// this transaction in the log.
    fn type_id(&self) -> u32;

    /// `true` suppresses logging: read-only transactions produce no writes
    /// and are elided from the durable log (spec.md §4.4).
    fn is_readonly(&self) -> bool {
        false
    }

    /// Body execution: issues reads and tentative writes against `ctx`.
    /// Returns `false` to abort.
    fn now_phase(&mut self, ctx: &mut TxnContext<'_>) -> bool;

    /// Finalize step, invoked only after `now_phase` returns `true` and every
    /// commit dependency has resolved to committed. No-op for read-only
    /// transactions.
    fn later_phase(&mut self, _ctx: &mut TxnContext<'_>) {}

    /// Write a self-describing body to `writer`. The core prefixes the
    /// result with `[type_id][length]` (spec.md §4.4); `serialize` writes
    /// only the body.
    fn serialize(&self, writer: &mut dyn Write) -> io::Result<()>;
}

/// Reconstructs a transaction of one registered type from an exact-length
/// byte source (spec.md §6: "a deserializer dispatcher maps each type id to
/// its factory").
pub type TransactionFactory = fn(&mut dyn Read) -> io::Result<Box<dyn Transaction>>;

/// Maps type ids to factories. Populated by external collaborators before
/// recovery runs; the core never hardcodes a transaction type.
#[derive(Default)]
pub struct TransactionRegistry {
    factories: std::collections::HashMap<u32, TransactionFactory>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `type_id`. Panics on a duplicate id: type ids
    /// are assigned out-of-band and a collision is a configuration bug, not
    /// a runtime condition (spec.md §6).
    pub fn register(&mut self, type_id: u32, factory: TransactionFactory) {
        assert!(type_id != 0, "transaction type id 0 is reserved");
        let prior = self.factories.insert(type_id, factory);
        assert!(prior.is_none(), "duplicate transaction type id {type_id}");
    }

    /// Reconstruct a transaction of `type_id` from `reader`, or `None` if no
    /// factory is registered for it.
    pub fn deserialize(&self, type_id: u32, reader: &mut dyn Read) -> io::Result<Option<Box<dyn Transaction>>> {
        match self.factories.get(&type_id) {
            Some(factory) => factory(reader).map(Some),
            None => Ok(None),
        }
    }
}
