//! Hand-off point once a stage's retry budget is spent.

use crate::core::{AttemptRecord, StageFailure, StageHealth, StageOutput};
use async_trait::async_trait;

/// Everything an escalation handler knows about the failing stage.
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    /// Run id.
    pub run_id: String,
    /// Stage that exhausted its budget.
    pub stage_name: String,
    /// The failure that triggered escalation.
    pub last_failure: StageFailure,
    /// Attempts of this call, oldest first.
    pub attempts: Vec<AttemptRecord>,
    /// Stage health at escalation time.
    pub health: StageHealth,
}

/// External recovery collaborator.
///
/// Returning an output recovers the stage as if it succeeded; returning a
/// failure makes the stage fatal.
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    /// Tries to recover the stage.
    async fn escalate(&self, request: &EscalationRequest) -> Result<StageOutput, StageFailure>;
}

/// Escalation that never recovers, marking every escalated stage fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastEscalation;

#[async_trait]
impl EscalationHandler for FailFastEscalation {
    async fn escalate(&self, request: &EscalationRequest) -> Result<StageOutput, StageFailure> {
        Err(StageFailure::permanent(
            "escalation",
            format!(
                "no recovery available for stage '{}' after {} attempt(s)",
                request.stage_name,
                request.attempts.len()
            ),
        ))
    }
}
