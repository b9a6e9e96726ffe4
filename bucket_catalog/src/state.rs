//! Global bucket identity to lifecycle-state table.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::BucketId;

/// Externally observable lifecycle state of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Open for inserts and commits.
    Normal,
    /// Exactly one batch has been selected to commit next.
    Prepared,
    /// Externally invalidated; pending batches will fail.
    Cleared,
    /// Invalidated while a commit was prepared; the in-flight prepared
    /// commit must be retried by its caller.
    PreparedAndCleared,
}

/// The id-to-state side table. Guarded by its own mutex, distinct from any
/// per-bucket mutex; it may be taken while a bucket is locked.
#[derive(Debug, Default)]
pub(crate) struct BucketStateMap {
    states: Mutex<HashMap<BucketId, BucketState>>,
}

impl BucketStateMap {
    pub(crate) fn insert_new(&self, id: BucketId) {
        self.states.lock().insert(id, BucketState::Normal);
    }

    /// Re-keys a bucket whose nominal open time was rewound.
    pub(crate) fn rekey(&self, old: BucketId, new: BucketId) {
        let mut states = self.states.lock();
        states.remove(&old);
        states.insert(new, BucketState::Normal);
    }

    pub(crate) fn remove(&self, id: BucketId) {
        self.states.lock().remove(&id);
    }

    pub(crate) fn get(&self, id: BucketId) -> Option<BucketState> {
        self.states.lock().get(&id).copied()
    }

    /// Drives the state machine towards `target` and returns the resulting
    /// state, or `None` for an unknown id. Transitions the table forbids
    /// are programmer errors and panic.
    pub(crate) fn transition(&self, id: BucketId, target: BucketState) -> Option<BucketState> {
        let mut states = self.states.lock();
        let state = states.get_mut(&id)?;
        match target {
            BucketState::Normal => match *state {
                BucketState::Prepared => *state = BucketState::Normal,
                BucketState::PreparedAndCleared => *state = BucketState::Cleared,
                BucketState::Normal => {}
                BucketState::Cleared => {
                    panic!("cleared bucket {id} cannot return to the normal state")
                }
            },
            BucketState::Prepared => {
                assert_eq!(
                    *state,
                    BucketState::Normal,
                    "bucket {id} must be normal to be prepared"
                );
                *state = BucketState::Prepared;
            }
            BucketState::Cleared => match *state {
                BucketState::Normal => *state = BucketState::Cleared,
                BucketState::Prepared => *state = BucketState::PreparedAndCleared,
                BucketState::Cleared | BucketState::PreparedAndCleared => {}
            },
            BucketState::PreparedAndCleared => {
                panic!("prepared-and-cleared is never a transition target")
            }
        }
        Some(*state)
    }
}
