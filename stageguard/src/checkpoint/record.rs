//! The persisted checkpoint record.

use crate::core::{PipelineState, StageHealth, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable snapshot of a run.
///
/// Loading is forward compatible: unknown fields are ignored and every field
/// except `run_id` has a default:
///
/// | field            | default            |
/// |------------------|--------------------|
/// | `version`        | `1`                |
/// | `sequence`       | `0`                |
/// | `stage_statuses` | empty              |
/// | `fsm_state`      | `IDLE`             |
/// | `updated_at`     | load time          |
/// | `latest_results` | empty              |
/// | `stage_health`   | empty              |
///
/// Only the most recent result per stage is kept, not the whole state
/// stack, so the record stays bounded by the number of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The run this checkpoint belongs to.
    pub run_id: String,
    /// Format version the record was written with.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Monotonic write counter, bumped on every save.
    #[serde(default)]
    pub sequence: u64,
    /// Coarse status per stage.
    #[serde(default)]
    pub stage_statuses: BTreeMap<String, StageStatus>,
    /// Primary state at the time of the write.
    #[serde(default)]
    pub fsm_state: PipelineState,
    /// When the record was written.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Most recent result payload per completed stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub latest_results: BTreeMap<String, serde_json::Value>,
    /// Health counters per stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_health: BTreeMap<String, StageHealth>,
}

const fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

impl Checkpoint {
    /// Creates an empty checkpoint for a new run.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            version: CHECKPOINT_VERSION,
            sequence: 0,
            stage_statuses: BTreeMap::new(),
            fsm_state: PipelineState::Idle,
            updated_at: Utc::now(),
            latest_results: BTreeMap::new(),
            stage_health: BTreeMap::new(),
        }
    }

    /// Sets one stage status.
    #[must_use]
    pub fn with_stage_status(mut self, stage: impl Into<String>, status: StageStatus) -> Self {
        self.stage_statuses.insert(stage.into(), status);
        self
    }

    /// Sets the primary state.
    #[must_use]
    pub const fn with_fsm_state(mut self, state: PipelineState) -> Self {
        self.fsm_state = state;
        self
    }

    /// Stage names whose status is `status`, sorted.
    #[must_use]
    pub fn stages_with_status(&self, status: StageStatus) -> Vec<&str> {
        self.stage_statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Returns true if every tracked stage completed.
    #[must_use]
    pub fn is_fully_complete(&self) -> bool {
        !self.stage_statuses.is_empty()
            && self
                .stage_statuses
                .values()
                .all(|s| *s == StageStatus::Completed)
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a checkpoint from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_minimal_record_uses_defaults() {
        let checkpoint = Checkpoint::from_json(r#"{"run_id": "run-7"}"#).unwrap();
        assert_eq!(checkpoint.run_id, "run-7");
        assert_eq!(checkpoint.version, CHECKPOINT_VERSION);
        assert_eq!(checkpoint.sequence, 0);
        assert_eq!(checkpoint.fsm_state, PipelineState::Idle);
        assert!(checkpoint.stage_statuses.is_empty());
        assert!(checkpoint.latest_results.is_empty());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{
            "run_id": "run-8",
            "version": 3,
            "fsm_state": "STAGE_RUNNING",
            "stage_statuses": {"plan": "COMPLETED", "build": "RUNNING"},
            "operator_note": "added by a newer writer",
            "updated_at": "2026-01-02T03:04:05Z"
        }"#;
        let checkpoint = Checkpoint::from_json(json).unwrap();
        assert_eq!(checkpoint.version, 3);
        assert_eq!(checkpoint.fsm_state, PipelineState::StageRunning);
        assert_eq!(checkpoint.stages_with_status(StageStatus::Running), vec!["build"]);
    }

    #[test]
    fn test_missing_run_id_rejected() {
        assert!(Checkpoint::from_json(r#"{"version": 1}"#).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let mut checkpoint = Checkpoint::new("run-9")
            .with_fsm_state(PipelineState::StageCompleted)
            .with_stage_status("plan", StageStatus::Completed)
            .with_stage_status("build", StageStatus::Pending);
        checkpoint
            .latest_results
            .insert("plan".to_string(), serde_json::json!({"data": {"steps": 3}}));

        let back = Checkpoint::from_json(&checkpoint.to_json().unwrap()).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_fully_complete() {
        assert!(!Checkpoint::new("empty").is_fully_complete());
        let partial = Checkpoint::new("p")
            .with_stage_status("a", StageStatus::Completed)
            .with_stage_status("b", StageStatus::Failed);
        assert!(!partial.is_fully_complete());
        let done = Checkpoint::new("d").with_stage_status("a", StageStatus::Completed);
        assert!(done.is_fully_complete());
    }
}
