//! A thread-safe in-memory holder for the currently active [`Snapshot`]. Readers (flag
//! evaluation) and the single writer (the poller) never block each other for longer than a
//! pointer swap.
use std::sync::{Arc, PoisonError, RwLock};

use crate::Snapshot;

/// `SnapshotStore` holds the current snapshot behind an `Arc`. Replacing it swaps the pointer, so
/// a reader that obtained a snapshot keeps seeing that exact snapshot in full, never a mix of old
/// and new entries.
#[derive(Default)]
pub(crate) struct SnapshotStore {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        SnapshotStore::default()
    }

    /// Get the currently active snapshot. Returns `None` until bootstrap flags or the first
    /// successful poll have been stored.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        // Poisoning means a writer panicked during a pointer assignment, which can't leave the
        // slot half-written. Keep serving whatever is there.
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        snapshot.clone()
    }

    /// Set new snapshot, returning the previous one.
    pub fn replace(&self, snapshot: Arc<Snapshot>) -> Option<Arc<Snapshot>> {
        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        slot.replace(snapshot)
    }
}
