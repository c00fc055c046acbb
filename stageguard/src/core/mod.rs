//! Core domain model types for stageguard.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Pipeline state and per-stage status enums
//! - Stage output and typed stage failures
//! - Per-stage health counters

mod attempt;
mod failure;
mod health;
mod output;
mod state;

pub use attempt::AttemptRecord;
pub use failure::{StageFailure, CANCELLED_KIND, TIMEOUT_KIND};
pub use health::StageHealth;
pub use output::StageOutput;
pub use state::{PipelineState, StageStatus, UnknownStateError};
