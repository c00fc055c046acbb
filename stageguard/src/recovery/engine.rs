//! Retry decisions.

use super::{FeedbackRule, JitterStrategy, RecoveryStrategy};
use crate::breaker::CircuitBreaker;
use crate::core::StageFailure;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Wait, then run the stage again.
    RetryAfter(Duration),
    /// Hand the stage to the escalation handler.
    Escalate,
    /// Stop now; the stage's breaker refuses further calls.
    Abort,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryAfter(delay) => write!(f, "retry after {:.3}s", delay.as_secs_f64()),
            Self::Escalate => f.write_str("escalate"),
            Self::Abort => f.write_str("abort"),
        }
    }
}

/// Looks up a stage's [`RecoveryStrategy`] and decides what follows a
/// failure.
///
/// Strategy lookup order: runtime override, per-stage strategy, defaults.
#[derive(Debug, Default)]
pub struct RecoveryEngine {
    defaults: RecoveryStrategy,
    strategies: HashMap<String, RecoveryStrategy>,
    overrides: DashMap<String, RecoveryStrategy>,
    feedback: Vec<FeedbackRule>,
    jitter: JitterStrategy,
}

impl RecoveryEngine {
    /// Creates an engine where every stage uses `defaults`.
    #[must_use]
    pub fn new(defaults: RecoveryStrategy) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    /// Uses `strategy` for `stage_name`.
    #[must_use]
    pub fn with_stage_strategy(
        mut self,
        stage_name: impl Into<String>,
        strategy: RecoveryStrategy,
    ) -> Self {
        self.strategies.insert(stage_name.into(), strategy);
        self
    }

    /// Adds a cross-stage feedback rule.
    #[must_use]
    pub fn with_feedback_rule(mut self, rule: FeedbackRule) -> Self {
        self.feedback.push(rule);
        self
    }

    /// Sets the jitter applied to retry delays.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Configured strategy for `stage_name`, ignoring runtime overrides.
    #[must_use]
    pub fn configured_strategy(&self, stage_name: &str) -> &RecoveryStrategy {
        self.strategies.get(stage_name).unwrap_or(&self.defaults)
    }

    /// Effective strategy for `stage_name`.
    #[must_use]
    pub fn strategy_for(&self, stage_name: &str) -> RecoveryStrategy {
        self.overrides.get(stage_name).map_or_else(
            || self.configured_strategy(stage_name).clone(),
            |strategy| strategy.clone(),
        )
    }

    /// Replaces the strategy of `stage_name` for the rest of the run.
    pub fn set_override(&self, stage_name: impl Into<String>, strategy: RecoveryStrategy) {
        self.overrides.insert(stage_name.into(), strategy);
    }

    /// Drops a runtime override.
    pub fn clear_override(&self, stage_name: &str) -> Option<RecoveryStrategy> {
        self.overrides.remove(stage_name).map(|(_, strategy)| strategy)
    }

    /// Applies the feedback rules targeting `stage_name`.
    ///
    /// `latest_result` resolves an upstream stage to its most recent result
    /// payload. Every matching rule widens the configured strategy in turn;
    /// the result becomes a runtime override. Returns the override when at
    /// least one rule matched.
    pub fn apply_feedback<F>(&self, stage_name: &str, latest_result: F) -> Option<RecoveryStrategy>
    where
        F: Fn(&str) -> Option<serde_json::Value>,
    {
        let mut widened: Option<RecoveryStrategy> = None;
        for rule in self.feedback.iter().filter(|r| r.dependent == stage_name) {
            let Some(payload) = latest_result(&rule.upstream) else {
                continue;
            };
            if !rule.matches(&payload) {
                continue;
            }
            let base = widened
                .take()
                .unwrap_or_else(|| self.configured_strategy(stage_name).clone());
            let next = rule.widen(&base);
            info!(
                stage = %stage_name,
                upstream = %rule.upstream,
                signal = %rule.signal_field,
                max_retries = next.max_retries,
                timeout_seconds = next.timeout_seconds,
                "Upstream signal widened recovery strategy"
            );
            widened = Some(next);
        }

        if let Some(ref strategy) = widened {
            self.set_override(stage_name, strategy.clone());
        }
        widened
    }

    /// Decides what follows failed attempt `attempt_number` (1-based).
    pub fn decide(
        &self,
        stage_name: &str,
        attempt_number: u32,
        last_error: &StageFailure,
        breaker: &CircuitBreaker,
    ) -> RecoveryAction {
        self.decide_at(stage_name, attempt_number, last_error, breaker, Instant::now())
    }

    /// [`decide`](Self::decide) with an explicit clock.
    ///
    /// The breaker is consulted first: a refusing breaker aborts regardless
    /// of the remaining budget. Non-retryable failures escalate at once.
    pub fn decide_at(
        &self,
        stage_name: &str,
        attempt_number: u32,
        last_error: &StageFailure,
        breaker: &CircuitBreaker,
        now: Instant,
    ) -> RecoveryAction {
        if !breaker.would_allow_at(now) {
            debug!(stage = %stage_name, attempt = attempt_number, "Breaker refuses, aborting");
            return RecoveryAction::Abort;
        }

        let strategy = self.strategy_for(stage_name);
        if !last_error.retryable || attempt_number > strategy.max_retries {
            return RecoveryAction::Escalate;
        }

        let delay = self.jitter.apply(strategy.delay_for(attempt_number));
        RecoveryAction::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn closed_breaker() -> CircuitBreaker {
        CircuitBreaker::new("stage", CircuitBreakerConfig::default())
    }

    fn failure() -> StageFailure {
        StageFailure::new("llm_error", "overloaded")
    }

    #[test]
    fn test_backoff_sequence_then_escalate() {
        let engine = RecoveryEngine::new(
            RecoveryStrategy::new()
                .with_max_retries(4)
                .with_base_delay(Duration::from_secs(1))
                .with_backoff_multiplier(2.0)
                .with_max_delay(Duration::from_secs(60)),
        );
        let breaker = closed_breaker();

        let actions: Vec<_> = (1..=5)
            .map(|n| engine.decide("build", n, &failure(), &breaker))
            .collect();
        assert_eq!(
            actions,
            vec![
                RecoveryAction::RetryAfter(Duration::from_secs(1)),
                RecoveryAction::RetryAfter(Duration::from_secs(2)),
                RecoveryAction::RetryAfter(Duration::from_secs(4)),
                RecoveryAction::RetryAfter(Duration::from_secs(8)),
                RecoveryAction::Escalate,
            ]
        );
    }

    #[test]
    fn test_open_breaker_aborts_regardless_of_budget() {
        let engine = RecoveryEngine::new(RecoveryStrategy::new().with_max_retries(10));
        let breaker = CircuitBreaker::new(
            "build",
            CircuitBreakerConfig::new().with_failure_threshold(1),
        );
        let now = Instant::now();
        breaker.record_failure_at(now);

        assert_eq!(
            engine.decide_at("build", 1, &failure(), &breaker, now),
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_non_retryable_escalates_immediately() {
        let engine = RecoveryEngine::default();
        let action = engine.decide(
            "plan",
            1,
            &StageFailure::permanent("validation", "bad card"),
            &closed_breaker(),
        );
        assert_eq!(action, RecoveryAction::Escalate);
    }

    #[test]
    fn test_stage_strategy_and_override() {
        let engine = RecoveryEngine::default()
            .with_stage_strategy("deploy", RecoveryStrategy::new().with_max_retries(0));
        assert_eq!(engine.strategy_for("deploy").max_retries, 0);
        assert_eq!(engine.strategy_for("plan").max_retries, 3);

        engine.set_override("deploy", RecoveryStrategy::new().with_max_retries(2));
        assert_eq!(engine.strategy_for("deploy").max_retries, 2);
        assert!(engine.clear_override("deploy").is_some());
        assert_eq!(engine.strategy_for("deploy").max_retries, 0);
    }

    #[test]
    fn test_feedback_widens_dependent_stage() {
        let engine = RecoveryEngine::new(
            RecoveryStrategy::new()
                .with_max_retries(1)
                .with_timeout(Duration::from_secs(10)),
        )
        .with_feedback_rule(
            FeedbackRule::new("analyze", "build", "complexity")
                .elevated_on("high")
                .with_extra_retries(2)
                .with_timeout_multiplier(3.0),
        );

        let calm = engine.apply_feedback("build", |_| Some(json!({"data": {"complexity": "low"}})));
        assert!(calm.is_none());
        assert_eq!(engine.strategy_for("build").max_retries, 1);

        let widened = engine
            .apply_feedback("build", |upstream| {
                assert_eq!(upstream, "analyze");
                Some(json!({"data": {"complexity": "high"}}))
            })
            .unwrap();
        assert_eq!(widened.max_retries, 3);
        assert_eq!(engine.strategy_for("build").timeout(), Duration::from_secs(30));

        // Applying again does not compound.
        engine.apply_feedback("build", |_| Some(json!({"data": {"complexity": "high"}})));
        assert_eq!(engine.strategy_for("build").max_retries, 3);

        // Other stages are untouched.
        assert!(engine.apply_feedback("review", |_| None).is_none());
        assert_eq!(engine.strategy_for("review").max_retries, 1);
    }

    #[test]
    fn test_action_display() {
        assert_eq!(
            RecoveryAction::RetryAfter(Duration::from_millis(1500)).to_string(),
            "retry after 1.500s"
        );
        assert_eq!(RecoveryAction::Abort.to_string(), "abort");
    }
}
