//! Pipeline and stage state enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The primary state of a pipeline run.
///
/// Which pairs of states may follow each other is decided by a
/// [`TransitionTable`](crate::machine::TransitionTable), never by the enum
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// Nothing has happened yet.
    Idle,
    /// The run is inspecting its input card.
    Analyzing,
    /// The run is deciding which stages to execute.
    Planning,
    /// A stage is executing.
    StageRunning,
    /// The most recent stage finished successfully.
    StageCompleted,
    /// The most recent stage failed.
    StageFailed,
    /// The run is recovering from a failure or an interrupted process.
    Recovering,
    /// Every stage completed.
    Completed,
    /// The run failed fatally.
    Failed,
    /// The run was aborted by an operator or cancellation signal.
    Aborted,
}

impl PipelineState {
    /// All states, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Idle,
        Self::Analyzing,
        Self::Planning,
        Self::StageRunning,
        Self::StageCompleted,
        Self::StageFailed,
        Self::Recovering,
        Self::Completed,
        Self::Failed,
        Self::Aborted,
    ];

    /// Returns the canonical upper-case name used in checkpoints.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Analyzing => "ANALYZING",
            Self::Planning => "PLANNING",
            Self::StageRunning => "STAGE_RUNNING",
            Self::StageCompleted => "STAGE_COMPLETED",
            Self::StageFailed => "STAGE_FAILED",
            Self::Recovering => "RECOVERING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    /// Returns true once the run can make no further progress on its own.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Returns true if a process that crashed in this state was mid-run.
    #[must_use]
    pub const fn is_interrupted(self) -> bool {
        matches!(
            self,
            Self::Analyzing
                | Self::Planning
                | Self::StageRunning
                | Self::StageCompleted
                | Self::StageFailed
                | Self::Recovering
        )
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown pipeline state '{0}'")]
pub struct UnknownStateError(pub String);

impl FromStr for PipelineState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| UnknownStateError(s.to_string()))
    }
}

/// Coarse per-stage status recorded in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// Stage has not started.
    Pending,
    /// Stage is executing (or was executing when the process died).
    Running,
    /// Stage produced a result.
    Completed,
    /// Stage failed after retries and escalation.
    Failed,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}
