//! Test assertions for supervised runs.

use crate::breaker::CircuitState;
use crate::core::StageStatus;
use crate::supervisor::Supervisor;

/// Asserts the recorded status of a stage.
pub fn assert_stage_status(supervisor: &Supervisor, stage_name: &str, expected: StageStatus) {
    let actual = supervisor.stage_status(stage_name);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage_name}' to be {expected}, got {actual:?}"
    );
}

/// Asserts `(execution_count, success_count, failure_count)` of a stage.
pub fn assert_health_counts(
    supervisor: &Supervisor,
    stage_name: &str,
    expected: (u32, u32, u32),
) {
    let health = supervisor
        .get_stage_health(stage_name)
        .unwrap_or_else(|| panic!("No health recorded for stage '{stage_name}'"));
    assert_eq!(
        (health.execution_count, health.success_count, health.failure_count),
        expected,
        "Unexpected health counters for stage '{stage_name}'"
    );
}

/// Asserts the breaker state of a stage.
pub fn assert_circuit_state(supervisor: &Supervisor, stage_name: &str, expected: CircuitState) {
    let actual = supervisor.get_circuit_state(stage_name);
    assert_eq!(
        actual, expected,
        "Expected circuit of '{stage_name}' to be {expected}, got {actual}"
    );
}
