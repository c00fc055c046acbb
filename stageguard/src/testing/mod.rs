//! Testing utilities for supervised runs.
//!
//! This module provides:
//! - Scripted, slow and always-succeeding stages
//! - A recording escalation handler
//! - Fast retry fixtures and supervisor assertions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_circuit_state, assert_health_counts, assert_stage_status};
pub use fixtures::{fast_config, fast_recovery, stage_list, test_context};
pub use mocks::{FailingStage, RecordingEscalation, ScriptedStage, SlowStage, SuccessStage};
