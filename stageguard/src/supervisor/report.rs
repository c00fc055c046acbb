//! Post-mortem view of a run.

use crate::breaker::CircuitBreakerState;
use crate::core::{AttemptRecord, PipelineState, StageHealth, StageStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write as _};

/// What happened to one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub stage_name: String,
    /// Last recorded status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StageStatus>,
    /// Health counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<StageHealth>,
    /// Breaker snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitBreakerState>,
    /// Attempts made in this process, oldest first.
    pub attempts: Vec<AttemptRecord>,
}

impl StageReport {
    /// Returns true if the stage ended FAILED or any attempt failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.status == Some(StageStatus::Failed) || self.attempts.iter().any(|a| !a.succeeded())
    }
}

/// Per-stage attempt history, health and breaker state of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    /// Run id.
    pub run_id: String,
    /// Primary state when the report was taken.
    pub state: PipelineState,
    /// When the report was taken.
    pub generated_at: DateTime<Utc>,
    /// One entry per known stage, sorted by name.
    pub stages: Vec<StageReport>,
}

impl FailureReport {
    pub(crate) fn build(
        run_id: &str,
        state: PipelineState,
        statuses: &BTreeMap<String, StageStatus>,
        health: &HashMap<String, StageHealth>,
        attempts: &HashMap<String, Vec<AttemptRecord>>,
        circuits: &BTreeMap<String, CircuitBreakerState>,
    ) -> Self {
        let names: BTreeSet<&String> = statuses
            .keys()
            .chain(health.keys())
            .chain(attempts.keys())
            .chain(circuits.keys())
            .collect();

        let stages = names
            .into_iter()
            .map(|name| StageReport {
                stage_name: name.clone(),
                status: statuses.get(name).copied(),
                health: health.get(name).cloned(),
                circuit: circuits.get(name).cloned(),
                attempts: attempts.get(name).cloned().unwrap_or_default(),
            })
            .collect();

        Self {
            run_id: run_id.to_string(),
            state,
            generated_at: Utc::now(),
            stages,
        }
    }

    /// Report of `stage_name`.
    #[must_use]
    pub fn stage(&self, stage_name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage_name == stage_name)
    }

    /// Stages that saw at least one failure.
    #[must_use]
    pub fn failed_stages(&self) -> Vec<&StageReport> {
        self.stages.iter().filter(|s| s.has_failures()).collect()
    }

    /// Pretty JSON rendering.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {} [{}]", self.run_id, self.state)?;
        for stage in &self.stages {
            let mut line = format!("  {}", stage.stage_name);
            if let Some(status) = stage.status {
                let _ = write!(line, " {status}");
            }
            if let Some(ref health) = stage.health {
                let _ = write!(
                    line,
                    " runs={} ok={} failed={}",
                    health.execution_count, health.success_count, health.failure_count
                );
            }
            if let Some(ref circuit) = stage.circuit {
                let _ = write!(line, " circuit={}", circuit.state);
            }
            writeln!(f, "{line}")?;
            for attempt in &stage.attempts {
                writeln!(f, "    {}", attempt.summary())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageFailure;
    use pretty_assertions::assert_eq;

    fn attempt(stage: &str, n: u32, failure: Option<StageFailure>) -> AttemptRecord {
        AttemptRecord {
            stage_name: stage.to_string(),
            attempt: n,
            started_at: Utc::now(),
            duration_ms: 5,
            decision: failure.as_ref().map(|_| "escalate".to_string()),
            failure,
        }
    }

    #[test]
    fn test_report_merges_sources() {
        let mut statuses = BTreeMap::new();
        statuses.insert("analyze".to_string(), StageStatus::Completed);
        statuses.insert("review".to_string(), StageStatus::Failed);

        let mut health = HashMap::new();
        let mut review = StageHealth::new();
        review.record_failure(std::time::Duration::from_millis(5), "boom");
        health.insert("review".to_string(), review.clone());

        let mut attempts = HashMap::new();
        attempts.insert(
            "review".to_string(),
            vec![attempt("review", 1, Some(StageFailure::new("llm_error", "boom")))],
        );

        let mut circuits = BTreeMap::new();
        circuits.insert("deploy".to_string(), CircuitBreakerState::default());

        let report = FailureReport::build(
            "run-7",
            PipelineState::Failed,
            &statuses,
            &health,
            &attempts,
            &circuits,
        );

        let names: Vec<&str> = report.stages.iter().map(|s| s.stage_name.as_str()).collect();
        assert_eq!(names, vec!["analyze", "deploy", "review"]);
        assert_eq!(report.stage("review").unwrap().health, Some(review));
        assert_eq!(report.failed_stages().len(), 1);

        let text = report.to_string();
        assert!(text.starts_with("run run-7 [FAILED]"));
        assert!(text.contains("review FAILED runs=1 ok=0 failed=1"));
        assert!(text.contains("#1 [llm_error] boom (5ms) -> escalate"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["run_id"], "run-7");
        assert_eq!(json["stages"][2]["status"], "FAILED");
    }
}
