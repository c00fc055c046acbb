//! Error types for stageguard.
//!
//! Structural errors (illegal transitions, open circuits, persistence
//! failures) always reach the caller. Stage failures are caught by the
//! supervisor and only surface, wrapped in [`RetryExhaustedError`], once
//! retries and escalation are used up.

use crate::core::{AttemptRecord, PipelineState, StageFailure, StageHealth};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for stageguard operations.
#[derive(Debug, Error)]
pub enum StageguardError {
    /// The state machine rejected a transition.
    #[error("{0}")]
    IllegalTransition(#[from] IllegalTransitionError),

    /// A stage's circuit breaker refused the call.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    /// Retries and escalation were exhausted.
    #[error("{0}")]
    RetryExhausted(#[from] RetryExhaustedError),

    /// Reading or writing a checkpoint failed.
    #[error("{0}")]
    CheckpointIo(#[from] CheckpointIoError),

    /// The configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The run was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// No checkpoint exists for the requested run.
    #[error("No checkpoint found for run '{0}'")]
    CheckpointNotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StageguardError {
    /// Short stable code for logs and reports.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::IllegalTransition(_) => "ILLEGAL_TRANSITION",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::RetryExhausted(_) => "RETRY_EXHAUSTED",
            Self::CheckpointIo(_) => "CHECKPOINT_IO",
            Self::Config(_) => "CONFIG",
            Self::Cancelled(_) => "CANCELLED",
            Self::CheckpointNotFound(_) => "CHECKPOINT_NOT_FOUND",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }

    /// Returns true if calling again later (not immediately) may succeed.
    #[must_use]
    pub const fn is_retryable_later(&self) -> bool {
        matches!(self, Self::CircuitOpen(_) | Self::CheckpointIo(_))
    }

    /// Returns the per-attempt history carried by the error, if any.
    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::CircuitOpen(err) => &err.attempts,
            Self::RetryExhausted(err) => &err.attempts,
            _ => &[],
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = match self {
            Self::IllegalTransition(err) => err.to_dict(),
            Self::CircuitOpen(err) => err.to_dict(),
            Self::RetryExhausted(err) => err.to_dict(),
            Self::CheckpointIo(err) => err.to_dict(),
            _ => HashMap::new(),
        };
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

impl From<serde_json::Error> for StageguardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error raised when a transition is not in the transition table.
#[derive(Debug, Clone, Error)]
#[error("Illegal transition {from} -> {to} (event '{event}')")]
pub struct IllegalTransitionError {
    /// The state the machine was in.
    pub from: PipelineState,
    /// The requested target state.
    pub to: PipelineState,
    /// The event that requested the transition.
    pub event: String,
    /// States reachable from `from`.
    pub allowed: Vec<PipelineState>,
}

impl IllegalTransitionError {
    /// Creates a new illegal transition error.
    #[must_use]
    pub fn new(
        from: PipelineState,
        to: PipelineState,
        event: impl Into<String>,
        allowed: Vec<PipelineState>,
    ) -> Self {
        Self {
            from,
            to,
            event: event.into(),
            allowed,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("from".to_string(), serde_json::json!(self.from));
        map.insert("to".to_string(), serde_json::json!(self.to));
        map.insert("event".to_string(), serde_json::json!(self.event));
        map.insert("allowed".to_string(), serde_json::json!(self.allowed));
        map
    }
}

/// Error raised when a stage's circuit breaker is open.
#[derive(Debug, Clone, Error)]
#[error("Circuit open for stage '{stage}'{}", format_retry_in(.retry_in))]
pub struct CircuitOpenError {
    /// The stage whose breaker is open.
    pub stage: String,
    /// When the breaker opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// Remaining cooldown before a probe is allowed.
    pub retry_in: Option<Duration>,
    /// Attempts made in this call before the breaker refused (empty when the
    /// guard refused up front).
    pub attempts: Vec<AttemptRecord>,
}

fn format_retry_in(retry_in: &Option<Duration>) -> String {
    retry_in.map_or_else(String::new, |d| {
        format!(" (probe allowed in {:.3}s)", d.as_secs_f64())
    })
}

impl CircuitOpenError {
    /// Creates a new circuit open error.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            opened_at: None,
            retry_in: None,
            attempts: Vec::new(),
        }
    }

    /// Sets when the breaker opened.
    #[must_use]
    pub fn with_opened_at(mut self, opened_at: DateTime<Utc>) -> Self {
        self.opened_at = Some(opened_at);
        self
    }

    /// Sets the remaining cooldown.
    #[must_use]
    pub fn with_retry_in(mut self, retry_in: Duration) -> Self {
        self.retry_in = Some(retry_in);
        self
    }

    /// Attaches the attempts made before the breaker refused.
    #[must_use]
    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage));
        if let Some(opened_at) = self.opened_at {
            map.insert("opened_at".to_string(), serde_json::json!(opened_at));
        }
        if let Some(retry_in) = self.retry_in {
            map.insert(
                "retry_in_seconds".to_string(),
                serde_json::json!(retry_in.as_secs_f64()),
            );
        }
        map.insert("attempts".to_string(), serde_json::json!(self.attempts));
        map
    }
}

/// A single failed stage attempt.
///
/// Attempts are retried inside the supervisor, so this is logged per attempt
/// and reachable from [`RetryExhaustedError::last_error`] rather than
/// returned on its own.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' failed on attempt {attempt}: {failure}")]
pub struct StageExecutionError {
    /// The stage name.
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The underlying stage failure.
    pub failure: StageFailure,
}

impl StageExecutionError {
    /// Creates a new stage execution error.
    #[must_use]
    pub fn new(stage: impl Into<String>, attempt: u32, failure: StageFailure) -> Self {
        Self {
            stage: stage.into(),
            attempt,
            failure,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage));
        map.insert("attempt".to_string(), serde_json::json!(self.attempt));
        map.insert("error_kind".to_string(), serde_json::json!(self.failure.kind));
        map.insert(
            "error_message".to_string(),
            serde_json::json!(self.failure.message),
        );
        map
    }
}

/// Error raised when a stage used its retry budget and escalation failed too.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' failed after {} attempt(s): {last_failure}", .attempts.len())]
pub struct RetryExhaustedError {
    /// The stage name.
    pub stage: String,
    /// The last failure observed.
    pub last_failure: StageFailure,
    /// Why escalation did not recover the stage.
    pub escalation_error: Option<String>,
    /// Every attempt of this call, oldest first.
    pub attempts: Vec<AttemptRecord>,
    /// Stage health at the time of the error.
    pub health: Option<StageHealth>,
}

impl RetryExhaustedError {
    /// Creates a new retry exhausted error.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        last_failure: StageFailure,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            stage: stage.into(),
            last_failure,
            escalation_error: None,
            attempts,
            health: None,
        }
    }

    /// Records why escalation failed.
    #[must_use]
    pub fn with_escalation_error(mut self, error: impl Into<String>) -> Self {
        self.escalation_error = Some(error.into());
        self
    }

    /// The final attempt's failure, with its stage name and attempt number.
    #[must_use]
    pub fn last_error(&self) -> StageExecutionError {
        let attempt = self
            .attempts
            .iter()
            .rev()
            .find(|record| record.failure.is_some())
            .map_or_else(
                || u32::try_from(self.attempts.len()).unwrap_or(u32::MAX),
                |record| record.attempt,
            );
        StageExecutionError::new(self.stage.clone(), attempt, self.last_failure.clone())
    }

    /// Attaches the stage health snapshot.
    #[must_use]
    pub fn with_health(mut self, health: StageHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage));
        map.insert("last_failure".to_string(), serde_json::json!(self.last_failure));
        if let Some(ref escalation) = self.escalation_error {
            map.insert("escalation_error".to_string(), serde_json::json!(escalation));
        }
        map.insert("attempts".to_string(), serde_json::json!(self.attempts));
        if let Some(ref health) = self.health {
            map.insert("health".to_string(), serde_json::json!(health));
        }
        map
    }
}

/// Error raised when checkpoint persistence fails.
#[derive(Debug, Clone, Error)]
#[error("Checkpoint {operation} failed for run '{run_id}': {message}")]
pub struct CheckpointIoError {
    /// The run whose checkpoint was being accessed.
    pub run_id: String,
    /// `"save"`, `"load"` or `"archive"`.
    pub operation: String,
    /// Underlying error message.
    pub message: String,
    /// File involved, for file-backed stores.
    pub path: Option<PathBuf>,
}

impl CheckpointIoError {
    /// Creates a new checkpoint IO error.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            operation: operation.into(),
            message: message.into(),
            path: None,
        }
    }

    /// Sets the file path involved.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), serde_json::json!(self.run_id));
        map.insert("operation".to_string(), serde_json::json!(self.operation));
        map.insert("error".to_string(), serde_json::json!(self.message));
        if let Some(ref path) = self.path {
            map.insert("path".to_string(), serde_json::json!(path.display().to_string()));
        }
        map
    }
}

/// Error raised when configuration is missing or invalid.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration{}: {message}", .field.as_ref().map(|f| format!(" for '{f}'")).unwrap_or_default())]
pub struct ConfigError {
    /// The offending field path, if known.
    pub field: Option<String>,
    /// What is wrong.
    pub message: String,
}

impl ConfigError {
    /// Creates a config error not tied to one field.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    /// Creates a config error for a specific field.
    #[must_use]
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_transition_message() {
        let err = IllegalTransitionError::new(
            PipelineState::Completed,
            PipelineState::StageRunning,
            "start_stage",
            vec![],
        );
        assert_eq!(
            err.to_string(),
            "Illegal transition COMPLETED -> STAGE_RUNNING (event 'start_stage')"
        );
        assert_eq!(err.to_dict().get("from").unwrap(), "COMPLETED");
    }

    #[test]
    fn test_circuit_open_message() {
        let err = CircuitOpenError::new("build").with_retry_in(Duration::from_millis(1500));
        assert_eq!(
            err.to_string(),
            "Circuit open for stage 'build' (probe allowed in 1.500s)"
        );
        assert_eq!(CircuitOpenError::new("x").to_string(), "Circuit open for stage 'x'");
    }

    #[test]
    fn test_error_codes() {
        let err: StageguardError = CircuitOpenError::new("build").into();
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert!(err.is_retryable_later());

        let dict = err.to_dict();
        assert_eq!(dict.get("code").unwrap(), "CIRCUIT_OPEN");
        assert_eq!(dict.get("stage").unwrap(), "build");
    }

    #[test]
    fn test_retry_exhausted_carries_history() {
        let failure = StageFailure::new("llm_error", "overloaded");
        let attempts = vec![AttemptRecord {
            stage_name: "review".to_string(),
            attempt: 1,
            started_at: Utc::now(),
            duration_ms: 5,
            failure: Some(failure.clone()),
            decision: Some("escalate".to_string()),
        }];
        let err: StageguardError = RetryExhaustedError::new("review", failure, attempts)
            .with_escalation_error("no recovery available")
            .into();

        assert_eq!(err.attempts().len(), 1);
        assert!(err.to_string().contains("after 1 attempt(s)"));
        let StageguardError::RetryExhausted(ref exhausted) = err else {
            panic!("expected RetryExhausted, got {err:?}");
        };
        let last = exhausted.last_error();
        assert_eq!((last.stage.as_str(), last.attempt), ("review", 1));
        assert_eq!(
            last.to_string(),
            format!("Stage 'review' failed on attempt 1: {}", last.failure)
        );
        assert_eq!(
            err.to_dict().get("escalation_error").unwrap(),
            "no recovery available"
        );
    }

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::field("stages.review.recovery.backoff_multiplier", "must be >= 1");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for 'stages.review.recovery.backoff_multiplier': must be >= 1"
        );
    }
}
