//! A table slot: one version-chain head plus its spin latch.

use crate::record::RecordNode;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// One array slot: the head of a key's version chain, and the single-bit
/// spin latch that serializes writers (spec.md §3).
///
/// Readers never touch `latch`; they observe `head` (and `head.next`) with
/// acquire loads and validate against torn snapshots in
/// [`crate::table::VersionedTable::get_version`].
pub struct Slot<V> {
    pub(crate) head: AtomicPtr<RecordNode<V>>,
    latch: AtomicBool,
}

impl<V> Slot<V> {
    pub fn empty() -> Self {
        Slot { head: AtomicPtr::new(ptr::null_mut()), latch: AtomicBool::new(false) }
    }

    /// Try to acquire the write latch. `false` means another writer holds
    /// it — the caller's `insert_version` aborts with `WriteConflict`.
    pub fn try_latch(&self) -> bool {
        self.latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the write latch. Called once per successful `try_latch`, by
    /// `finalize_version` or `remove_version`.
    pub fn unlatch(&self) {
        self.latch.store(false, Ordering::Release);
    }

    #[cfg(debug_assertions)]
    pub(crate) fn is_latched(&self) -> bool {
        self.latch.load(Ordering::Acquire)
    }
}
