//! # Stageguard
//!
//! Supervised execution of multi-stage pipelines.
//!
//! Stageguard runs an ordered set of stages over a single work item and
//! keeps the run recoverable:
//!
//! - **Explicit state machine**: a validated transition table plus a stack of
//!   per-stage results, written through to a checkpoint on every change
//! - **Per-stage circuit breakers**: repeated failures stop traffic to a
//!   stage until a cooldown elapses
//! - **Bounded retries**: exponential backoff, then escalation to an
//!   external handler
//! - **Resume**: an interrupted run continues from its last checkpoint
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stageguard::prelude::*;
//!
//! let supervisor = Supervisor::builder()
//!     .config(SupervisorConfig::from_file("stageguard.toml")?)
//!     .card(serde_json::json!({"title": "Add login"}))
//!     .build()?;
//!
//! let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(Analyze), Arc::new(Review)];
//! let results = supervisor.run(&stages).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod breaker;
pub mod cancellation;
pub mod checkpoint;
pub mod core;
pub mod errors;
pub mod events;
pub mod machine;
pub mod observability;
pub mod recovery;
pub mod stages;
pub mod supervisor;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::breaker::{CircuitBreakerConfig, CircuitState};
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{
        Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    };
    pub use crate::core::{
        PipelineState, StageFailure, StageHealth, StageOutput, StageStatus,
    };
    pub use crate::errors::StageguardError;
    pub use crate::events::{EventSink, LoggingEventSink, PipelineEvent};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::recovery::{EscalationHandler, FeedbackRule, RecoveryStrategy};
    pub use crate::stages::{Stage, StageContext};
    pub use crate::supervisor::{Supervisor, SupervisorConfig};
}
