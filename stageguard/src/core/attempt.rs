//! Per-attempt history records.

use super::StageFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One attempt of one stage, as reported in failure reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Stage name.
    pub stage_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Attempt duration in milliseconds.
    pub duration_ms: u64,
    /// The failure, or `None` if the attempt succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    /// What the recovery engine decided after this attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

impl AttemptRecord {
    /// Returns true if the attempt produced an output.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// One-line summary used in reports.
    #[must_use]
    pub fn summary(&self) -> String {
        let outcome = self
            .failure
            .as_ref()
            .map_or_else(|| "ok".to_string(), ToString::to_string);
        match &self.decision {
            Some(decision) => format!(
                "#{} {} ({}ms) -> {}",
                self.attempt, outcome, self.duration_ms, decision
            ),
            None => format!("#{} {} ({}ms)", self.attempt, outcome, self.duration_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_summary() {
        let record = AttemptRecord {
            stage_name: "review".to_string(),
            attempt: 2,
            started_at: Utc::now(),
            duration_ms: 35,
            failure: Some(StageFailure::new("llm_error", "overloaded")),
            decision: Some("retry after 2.000s".to_string()),
        };
        assert!(!record.succeeded());
        assert_eq!(
            record.summary(),
            "#2 [llm_error] overloaded (35ms) -> retry after 2.000s"
        );
    }
}
