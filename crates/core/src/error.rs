//! The error taxonomy shared by every ChronoDB crate (spec.md §7).

use crate::key::CompositeKey;
use thiserror::Error;

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised anywhere in the ChronoDB core.
///
/// Conflict and dependency failures (`WriteConflict`,
/// `CommitDependencyAborted`) are normal, in-band transaction outcomes: a
/// caller sees them as an abort, not a process-level failure. `IoFailure`
/// and `LogCorruption` are unrecoverable by contract (spec.md §7's
/// rationale: synchronous durability means continuing risks silent data
/// loss) — library crates return them, but only `chronodb-engine` decides to
/// terminate the process.
#[derive(Debug, Error)]
pub enum Error {
    /// `insert_version`'s latch compare-and-swap lost a race.
    #[error("write conflict on table {table_id} key {key}")]
    WriteConflict {
        /// Table the conflicting write targeted.
        table_id: u32,
        /// Key the conflicting write targeted.
        key: u64,
    },

    /// A commit dependency resolved to `Aborted`.
    #[error("commit dependency on transaction {dependency_txn_id} aborted")]
    CommitDependencyAborted {
        /// The transaction id this one depended on.
        dependency_txn_id: u64,
    },

    /// A chain walk exhausted without finding a version valid at `ts`.
    #[error("no version of {key:?} valid at timestamp {ts_raw}")]
    ReadStale {
        /// The key that was searched for.
        key: CompositeKey,
        /// The raw logical timestamp that was searched at.
        ts_raw: u64,
    },

    /// A version buffer or log memory buffer could not reserve space.
    #[error("buffer capacity exceeded (requested {requested} bytes)")]
    BufferCapacityExceeded {
        /// Bytes the caller tried to reserve or append.
        requested: usize,
    },

    /// A log write or read failed at the OS level.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Restore encountered a truncated or malformed log record.
    #[error("log corruption: {0}")]
    LogCorruption(String),

    /// Table/record configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl Error {
    /// `true` for errors that are normal, expected transaction outcomes
    /// rather than process-level failures.
    pub fn is_transaction_outcome(&self) -> bool {
        matches!(
            self,
            Error::WriteConflict { .. } | Error::CommitDependencyAborted { .. } | Error::ReadStale { .. }
        )
    }

    /// `true` for errors that, per spec.md §7, are unrecoverable and should
    /// terminate the process once logged.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::IoFailure(_) | Error::LogCorruption(_))
    }
}
