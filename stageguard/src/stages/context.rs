//! What a stage sees while it runs.

use crate::cancellation::CancellationToken;
use crate::core::StageOutput;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only context handed to [`Stage::execute`](super::Stage::execute).
///
/// Cloning is cheap; the card, upstream results and token are shared.
#[derive(Debug, Clone)]
pub struct StageContext {
    run_id: String,
    stage_name: String,
    attempt: u32,
    card: Arc<serde_json::Value>,
    upstream: Arc<HashMap<String, serde_json::Value>>,
    cancellation: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a context for attempt `attempt` (1-based) of `stage_name`.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage_name: impl Into<String>,
        attempt: u32,
        card: Arc<serde_json::Value>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage_name: stage_name.into(),
            attempt,
            card,
            upstream: Arc::new(HashMap::new()),
            cancellation: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the latest results of previously completed stages.
    #[must_use]
    pub fn with_upstream(mut self, upstream: Arc<HashMap<String, serde_json::Value>>) -> Self {
        self.upstream = upstream;
        self
    }

    /// Shares the run's cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Name the stage runs under.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// 1-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns true on retries.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    /// The work item the run processes.
    #[must_use]
    pub fn card(&self) -> &serde_json::Value {
        &self.card
    }

    /// Latest output of an upstream stage.
    #[must_use]
    pub fn upstream_output(&self, stage_name: &str) -> Option<StageOutput> {
        self.upstream.get(stage_name).map(StageOutput::from_payload)
    }

    /// Raw latest payloads of all upstream stages.
    #[must_use]
    pub fn upstream_results(&self) -> &HashMap<String, serde_json::Value> {
        &self.upstream
    }

    /// Returns true once the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
