//! The transaction execution engine: worker state machine, commit-dependency
//! tracking, and the pipelined-pieces variant (spec.md §4.3).

pub mod context;
pub mod dependency;
pub mod piece;
pub mod transaction;
pub mod worker;

pub use context::TxnContext;
pub use dependency::{commit_queues, CommitFanout, DepMessage, DepOutcome, DependencySet};
pub use piece::{DepType, DependencyTable, PieceDescriptor, PieceGate, Pieced};
pub use transaction::{RecordBytes, Transaction, TransactionFactory, TransactionRegistry};
pub use worker::{BatchOutcome, TableRegistry, Worker};
