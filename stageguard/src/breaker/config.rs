//! Circuit breaker configuration.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for one stage's circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive CLOSED failures that open the circuit.
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before allowing a probe.
    pub cooldown_seconds: f64,
    /// Probe successes needed in HALF_OPEN to close again.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 60.0,
            half_open_success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a config with the default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cooldown.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_seconds = cooldown.as_secs_f64();
        self
    }

    /// Sets the number of probe successes needed to close.
    #[must_use]
    pub const fn with_half_open_success_threshold(mut self, threshold: u32) -> Self {
        self.half_open_success_threshold = threshold;
        self
    }

    /// Cooldown as a [`Duration`].
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_seconds).unwrap_or(Duration::ZERO)
    }

    /// Checks the thresholds and cooldown.
    pub fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::field(
                format!("{prefix}.failure_threshold"),
                "must be at least 1",
            ));
        }
        if self.half_open_success_threshold == 0 {
            return Err(ConfigError::field(
                format!("{prefix}.half_open_success_threshold"),
                "must be at least 1",
            ));
        }
        if !self.cooldown_seconds.is_finite() || self.cooldown_seconds < 0.0 {
            return Err(ConfigError::field(
                format!("{prefix}.cooldown_seconds"),
                "must be a non-negative number",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown(), Duration::from_secs(60));
        assert!(config.validate("breaker").is_ok());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = CircuitBreakerConfig::new()
            .with_failure_threshold(0)
            .validate("stages.build.breaker")
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("stages.build.breaker.failure_threshold"));
    }

    #[test]
    fn test_negative_cooldown_rejected() {
        let config = CircuitBreakerConfig {
            cooldown_seconds: -1.0,
            ..CircuitBreakerConfig::default()
        };
        assert!(config.validate("breaker").is_err());
        assert_eq!(config.cooldown(), Duration::ZERO);
    }
}
