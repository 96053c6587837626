//! Composite keys, logical timestamps and tagged-field primitives shared by
//! every layer of the ChronoDB engine.
//!
//! This crate has no concurrency or I/O of its own — it defines the vocabulary
//! (`CompositeKey`, `LogicalTimestamp`, `TaggedField`/`TxnCell`, `Error`) that
//! `chronodb-table`, `chronodb-txn`, `chronodb-log` and `chronodb-engine`
//! build on.

pub mod error;
pub mod key;
pub mod tag;
pub mod timestamp;

pub use error::{Error, Result};
pub use key::CompositeKey;
pub use tag::{FieldValue, TaggedField, TxnCell, TxnState};
pub use timestamp::LogicalTimestamp;
