//! Checkpoint storage seam and the in-memory store.

use super::Checkpoint;
use crate::errors::CheckpointIoError;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Durable storage of checkpoints keyed by run id.
///
/// Calls are synchronous: the state machine writes through on every
/// mutation while holding its lock, so a write never interleaves with
/// another mutation of the same run.
#[cfg_attr(test, mockall::automock)]
pub trait CheckpointStore: Send + Sync {
    /// Replaces the active checkpoint of `run_id`.
    fn save(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointIoError>;

    /// Loads the active checkpoint of `run_id`, `None` if there is none.
    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointIoError>;

    /// Moves the active checkpoint of `run_id` out of the active set.
    ///
    /// Archived checkpoints are kept, never deleted. Archiving a run with no
    /// active checkpoint is a no-op.
    fn archive(&self, run_id: &str) -> Result<(), CheckpointIoError>;

    /// Run ids with an active checkpoint, sorted.
    fn list_runs(&self) -> Result<Vec<String>, CheckpointIoError>;
}

/// Process-local store, for tests and runs that need no durability.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    active: RwLock<HashMap<String, Checkpoint>>,
    archived: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived checkpoints of `run_id`, oldest first.
    #[must_use]
    pub fn archived(&self, run_id: &str) -> Vec<Checkpoint> {
        self.archived.read().get(run_id).cloned().unwrap_or_default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointIoError> {
        self.active
            .write()
            .insert(run_id.to_string(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointIoError> {
        Ok(self.active.read().get(run_id).cloned())
    }

    fn archive(&self, run_id: &str) -> Result<(), CheckpointIoError> {
        if let Some(checkpoint) = self.active.write().remove(run_id) {
            self.archived
                .write()
                .entry(run_id.to_string())
                .or_default()
                .push(checkpoint);
        }
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<String>, CheckpointIoError> {
        let mut runs: Vec<_> = self.active.read().keys().cloned().collect();
        runs.sort();
        Ok(runs)
    }
}
