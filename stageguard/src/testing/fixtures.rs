//! Test fixtures for supervised runs.

use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::recovery::RecoveryStrategy;
use crate::stages::{Stage, StageContext};
use crate::supervisor::SupervisorConfig;

/// Builds a context for attempt `attempt` of `stage_name` with an empty card.
#[must_use]
pub fn test_context(stage_name: &str, attempt: u32) -> StageContext {
    StageContext::new("test-run", stage_name, attempt, Arc::new(serde_json::json!({})))
}

/// A retry policy with millisecond delays, for tests that retry.
#[must_use]
pub fn fast_recovery(max_retries: u32) -> RecoveryStrategy {
    RecoveryStrategy::new()
        .with_max_retries(max_retries)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(10))
        .with_timeout(Duration::from_secs(5))
}

/// Supervisor config with [`fast_recovery`] defaults and the given breaker
/// threshold.
#[must_use]
pub fn fast_config(max_retries: u32, failure_threshold: u32) -> SupervisorConfig {
    SupervisorConfig::new()
        .with_default_recovery(fast_recovery(max_retries))
        .with_default_breaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(failure_threshold)
                .with_cooldown(Duration::from_secs(60)),
        )
}

/// Erases concrete stage types for [`Supervisor::run`](crate::supervisor::Supervisor::run).
#[must_use]
pub fn stage_list<S: Stage + 'static>(stages: Vec<S>) -> Vec<Arc<dyn Stage>> {
    stages
        .into_iter()
        .map(|stage| Arc::new(stage) as Arc<dyn Stage>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SuccessStage;

    #[test]
    fn test_fast_config_is_valid() {
        let config = fast_config(2, 3);
        assert!(config.validate().is_ok());
        assert!(config.defaults.recovery.delay_for(5) <= Duration::from_millis(10));
        assert_eq!(config.defaults.breaker.failure_threshold, 3);
    }

    #[test]
    fn test_stage_list() {
        let stages = stage_list(vec![SuccessStage::new("a"), SuccessStage::new("b")]);
        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
