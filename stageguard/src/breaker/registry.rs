//! Breakers keyed by stage name.

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Lazily creates one breaker per stage name.
///
/// Breakers start CLOSED on first use and live as long as the registry.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates a registry where every stage uses `defaults`.
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Uses `config` for `stage_name` instead of the defaults.
    #[must_use]
    pub fn with_stage_config(
        mut self,
        stage_name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.overrides.insert(stage_name.into(), config);
        self
    }

    /// Config that applies to `stage_name`.
    #[must_use]
    pub fn config_for(&self, stage_name: &str) -> &CircuitBreakerConfig {
        self.overrides.get(stage_name).unwrap_or(&self.defaults)
    }

    /// Returns the breaker for `stage_name`, creating it CLOSED if needed.
    pub fn get_or_create(&self, stage_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(stage_name) {
            return Arc::clone(&breaker);
        }
        let config = self.config_for(stage_name).clone();
        Arc::clone(
            &self
                .breakers
                .entry(stage_name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(stage_name, config))),
        )
    }

    /// Returns the breaker for `stage_name` if one was created.
    #[must_use]
    pub fn get(&self, stage_name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(stage_name).map(|b| Arc::clone(&b))
    }

    /// Snapshot of every breaker, sorted by stage name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, CircuitBreakerState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker was created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use std::time::Duration;

    #[test]
    fn test_breakers_created_closed_and_shared() {
        let registry = BreakerRegistry::default();
        assert!(registry.get("plan").is_none());

        let first = registry.get_or_create("plan");
        let second = registry.get_or_create("plan");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), CircuitState::Closed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stage_overrides() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default()).with_stage_config(
            "deploy",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_secs(600)),
        );

        registry.get_or_create("deploy").record_failure();
        registry.get_or_create("review").record_failure();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["deploy"].state, CircuitState::Open);
        assert_eq!(snapshot["review"].state, CircuitState::Closed);
        assert_eq!(registry.config_for("review").failure_threshold, 5);
    }
}
