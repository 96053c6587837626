//! Top-level facade: re-exports the engine's public API and wires up
//! human-readable logging for binaries and integration tests.
//!
//! Library crates in this workspace never install a `tracing` subscriber,
//! only emit through the facade; only this crate (or a binary/test built on
//! top of it) decides how those events are rendered.

pub use chronodb_core::{Error, LogicalTimestamp, Result};
pub use chronodb_engine::{Engine, EngineConfig, EngineConfigBuilder, SubmitOutcome, TableConfig, TableRegistry};
pub use chronodb_txn::{Transaction, TransactionRegistry, TxnContext};

/// Install a `tracing-subscriber` `fmt` layer controlled by `RUST_LOG`
/// (defaulting to `info`), for binaries and tests that want readable output.
///
/// Safe to call more than once per process: later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}
