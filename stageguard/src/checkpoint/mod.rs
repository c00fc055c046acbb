//! Crash-safe persistence of run progress.
//!
//! The state machine derives a [`Checkpoint`] from its state and writes it
//! through a [`CheckpointStore`] after every mutation. A crashed process
//! loads the checkpoint and resumes at the last completed stage.

mod file;
mod record;
mod store;

pub use file::FileCheckpointStore;
pub use record::{Checkpoint, CHECKPOINT_VERSION};
#[cfg(test)]
pub use store::MockCheckpointStore;
pub use store::{CheckpointStore, InMemoryCheckpointStore};
