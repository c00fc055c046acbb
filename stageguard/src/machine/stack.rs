//! Append-only journal of `(state, context)` entries.
//!
//! The stack is separate from the primary state: it records what each stage
//! produced (or how it failed) without widening the small state set.

use crate::core::{PipelineState, StageFailure, StageOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Context key holding the stage name.
pub const STAGE_NAME_KEY: &str = "stage_name";
/// Context key holding the stage result payload.
pub const RESULT_KEY: &str = "result";
/// Context key holding the attempt duration in milliseconds.
pub const DURATION_KEY: &str = "duration_ms";
/// Context key holding the number of retries before this entry.
pub const RETRY_COUNT_KEY: &str = "retry_count";
/// Context key holding the failure message.
pub const ERROR_MESSAGE_KEY: &str = "error_message";
/// Context key holding the failure classifier.
pub const ERROR_KIND_KEY: &str = "error_kind";
/// Context key marking entries rebuilt from a checkpoint.
pub const RESTORED_KEY: &str = "restored";

/// One immutable journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStackEntry {
    /// The state this entry records.
    pub state: PipelineState,
    /// When the entry was pushed.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary context; see the `*_KEY` constants for the keys the
    /// supervisor writes.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl StateStackEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(state: PipelineState, context: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            context,
        }
    }

    /// Builds the STAGE_COMPLETED entry for a successful attempt.
    #[must_use]
    pub fn stage_completed(
        stage_name: &str,
        output: &StageOutput,
        duration: Duration,
        retry_count: u32,
    ) -> Self {
        let mut context = serde_json::Map::new();
        context.insert(STAGE_NAME_KEY.to_string(), serde_json::json!(stage_name));
        context.insert(RESULT_KEY.to_string(), output.to_payload());
        context.insert(DURATION_KEY.to_string(), duration_ms_json(duration));
        context.insert(RETRY_COUNT_KEY.to_string(), serde_json::json!(retry_count));
        Self::new(PipelineState::StageCompleted, context)
    }

    /// Builds the STAGE_FAILED entry for a failed attempt.
    #[must_use]
    pub fn stage_failed(stage_name: &str, failure: &StageFailure, retry_count: u32) -> Self {
        let mut context = serde_json::Map::new();
        context.insert(STAGE_NAME_KEY.to_string(), serde_json::json!(stage_name));
        context.insert(ERROR_MESSAGE_KEY.to_string(), serde_json::json!(failure.message));
        context.insert(ERROR_KIND_KEY.to_string(), serde_json::json!(failure.kind));
        context.insert(RETRY_COUNT_KEY.to_string(), serde_json::json!(retry_count));
        Self::new(PipelineState::StageFailed, context)
    }

    /// Builds a STAGE_COMPLETED entry for a result restored from a checkpoint.
    #[must_use]
    pub fn restored(stage_name: &str, payload: serde_json::Value) -> Self {
        let mut context = serde_json::Map::new();
        context.insert(STAGE_NAME_KEY.to_string(), serde_json::json!(stage_name));
        context.insert(RESULT_KEY.to_string(), payload);
        context.insert(RESTORED_KEY.to_string(), serde_json::json!(true));
        Self::new(PipelineState::StageCompleted, context)
    }

    /// Returns the stage name recorded in the context.
    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        self.context.get(STAGE_NAME_KEY).and_then(serde_json::Value::as_str)
    }

    /// Returns the result payload of a STAGE_COMPLETED entry.
    #[must_use]
    pub fn result(&self) -> Option<&serde_json::Value> {
        if self.state == PipelineState::StageCompleted {
            self.context.get(RESULT_KEY)
        } else {
            None
        }
    }

    /// Returns true if this entry was rebuilt from a checkpoint.
    #[must_use]
    pub fn is_restored(&self) -> bool {
        self.context
            .get(RESTORED_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    fn completed_result_for(&self, stage_name: &str) -> Option<&serde_json::Value> {
        if self.stage_name() == Some(stage_name) {
            self.result()
        } else {
            None
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms_json(duration: Duration) -> serde_json::Value {
    serde_json::json!(duration.as_millis() as u64)
}

/// The pushdown stack.
#[derive(Debug, Clone, Default)]
pub struct StateStack {
    entries: Vec<StateStackEntry>,
}

impl StateStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Always succeeds.
    pub fn push(&mut self, entry: StateStackEntry) {
        self.entries.push(entry);
    }

    /// Removes and returns the top entry, `None` when empty.
    pub fn pop(&mut self) -> Option<StateStackEntry> {
        self.entries.pop()
    }

    /// Returns the top entry.
    #[must_use]
    pub fn peek(&self) -> Option<&StateStackEntry> {
        self.entries.last()
    }

    /// Returns all entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> &[StateStackEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was pushed (or everything was popped).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent STAGE_COMPLETED payload for `stage_name`.
    ///
    /// Scans from the top and stops at the first match.
    #[must_use]
    pub fn latest_result(&self, stage_name: &str) -> Option<&serde_json::Value> {
        self.entries
            .iter()
            .rev()
            .find_map(|entry| entry.completed_result_for(stage_name))
    }

    /// Most recent STAGE_COMPLETED payload of every stage, in one scan.
    #[must_use]
    pub fn all_latest_results(&self) -> HashMap<String, serde_json::Value> {
        let mut results = HashMap::new();
        for entry in self.entries.iter().rev() {
            let (Some(name), Some(result)) = (entry.stage_name(), entry.result()) else {
                continue;
            };
            results
                .entry(name.to_string())
                .or_insert_with(|| result.clone());
        }
        results
    }

    /// Entries recorded for one stage, oldest first.
    #[must_use]
    pub fn entries_for(&self, stage_name: &str) -> Vec<&StateStackEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.stage_name() == Some(stage_name))
            .collect()
    }
}
