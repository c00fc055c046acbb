//! Typed failures raised by stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind used when an attempt exceeds its timeout.
pub const TIMEOUT_KIND: &str = "timeout";
/// Kind used when an attempt is interrupted by run cancellation.
pub const CANCELLED_KIND: &str = "cancelled";

/// A failure returned by [`Stage::execute`](crate::stages::Stage::execute).
///
/// `kind` is a short machine-readable classifier (`"llm_error"`,
/// `"validation"`, `"timeout"`, ...). Non-retryable failures skip the
/// remaining retry budget and go straight to escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Error classifier.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Whether another attempt could succeed.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

const fn default_retryable() -> bool {
    true
}

impl StageFailure {
    /// Creates a retryable failure.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a failure that should not be retried.
    #[must_use]
    pub fn permanent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates the failure recorded when an attempt times out.
    #[must_use]
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            TIMEOUT_KIND,
            format!("attempt exceeded timeout of {:.3}s", limit.as_secs_f64()),
        )
    }

    /// Creates the failure recorded when the run is cancelled mid-attempt.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::permanent(CANCELLED_KIND, reason)
    }

    /// Returns true if this failure came from a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == TIMEOUT_KIND
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for StageFailure {}

impl From<std::io::Error> for StageFailure {
    fn from(err: std::io::Error) -> Self {
        Self::new("io", err.to_string())
    }
}

impl From<serde_json::Error> for StageFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent("serialization", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        let failure = StageFailure::new("llm_error", "rate limited");
        assert_eq!(failure.to_string(), "[llm_error] rate limited");
        assert!(failure.retryable);
    }

    #[test]
    fn test_permanent_failure() {
        let failure = StageFailure::permanent("validation", "bad card");
        assert!(!failure.retryable);
    }

    #[test]
    fn test_timeout_failure() {
        let failure = StageFailure::timeout(Duration::from_millis(1500));
        assert!(failure.is_timeout());
        assert!(failure.retryable);
        assert!(failure.message.contains("1.500s"));
    }

    #[test]
    fn test_missing_retryable_defaults_true() {
        let failure: StageFailure =
            serde_json::from_str(r#"{"kind":"io","message":"disk"}"#).unwrap();
        assert!(failure.retryable);
    }
}
