//! Engine orchestration: configuration and the wiring that drives
//! restore-then-live batch execution through the worker pool and log stage
//! (spec.md §4.3–§4.5).
//!
//! spec.md §4.6's bounded inter-stage queue ("fourth, lighter-weight
//! collaborator") exists to carry batches between CPU-pinned pipeline
//! stages running concurrently; CPU pinning and continuous pipelining are
//! out of scope here (Non-goals), and `Engine::submit_batch` instead joins
//! every worker's slice synchronously before advancing to the log stage, so
//! there is no second stage for a queue to sit between.

pub mod config;
pub mod database;

pub use config::{EngineConfig, EngineConfigBuilder, TableConfig};
pub use database::{Engine, SubmitOutcome};
pub use chronodb_txn::TableRegistry;
