//! Per-stage retry budget, backoff and jitter.

use crate::errors::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// Exact backoff delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

impl JitterStrategy {
    /// Applies the jitter to `delay`.
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let jittered = match self {
            Self::None => return delay,
            Self::Full => {
                if millis == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=millis)
                }
            }
            Self::Equal => {
                let half = millis / 2;
                if half == 0 {
                    millis
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

/// Retry policy for one stage.
///
/// `max_retries` counts retries after the first attempt, so a stage may run
/// up to `max_retries + 1` times before escalating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryStrategy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub base_delay_seconds: f64,
    /// Factor applied to the delay for every further retry.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in seconds.
    pub max_delay_seconds: f64,
    /// Upper bound on one attempt, in seconds.
    pub timeout_seconds: f64,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_seconds: 1.0,
            backoff_multiplier: 2.0,
            max_delay_seconds: 60.0,
            timeout_seconds: 300.0,
        }
    }
}

impl RecoveryStrategy {
    /// Creates a strategy with the default budget.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_seconds = delay.as_secs_f64();
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_seconds = delay.as_secs_f64();
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds)
    }

    /// Delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        seconds(self.max_delay_seconds)
    }

    /// Delay after the failed attempt `attempt_number` (1-based):
    /// `base * multiplier^(attempt_number - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        // 0 * inf is NaN, so a zero base has to short-circuit.
        if self.base_delay_seconds <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt_number.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay_seconds * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_seconds)
        } else {
            self.max_delay_seconds
        };
        seconds(capped)
    }

    /// Checks the budget and delays.
    pub fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        for (name, value) in [
            ("base_delay_seconds", self.base_delay_seconds),
            ("max_delay_seconds", self.max_delay_seconds),
            ("timeout_seconds", self.timeout_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::field(
                    format!("{prefix}.{name}"),
                    "must be a non-negative number",
                ));
            }
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::field(
                format!("{prefix}.backoff_multiplier"),
                "must be at least 1.0",
            ));
        }
        if self.base_delay_seconds > self.max_delay_seconds {
            return Err(ConfigError::field(
                format!("{prefix}.base_delay_seconds"),
                "must not exceed max_delay_seconds",
            ));
        }
        if self.timeout_seconds == 0.0 {
            return Err(ConfigError::field(
                format!("{prefix}.timeout_seconds"),
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Negative and NaN values clamp to zero, overflow to [`Duration::MAX`].
fn seconds(value: f64) -> Duration {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) => duration,
        Err(_) if value > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exponential_delays() {
        let strategy = RecoveryStrategy::new()
            .with_base_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_max_retries(4);

        let delays: Vec<_> = (1..=4).map(|n| strategy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_delay_capped() {
        let strategy = RecoveryStrategy::new()
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(25));
        assert_eq!(strategy.delay_for(3), Duration::from_secs(25));
        assert_eq!(strategy.delay_for(u32::MAX), Duration::from_secs(25));
    }

    #[test]
    fn test_zero_base_delay_never_waits() {
        let strategy = RecoveryStrategy::new()
            .with_base_delay(Duration::ZERO)
            .with_backoff_multiplier(10.0);
        assert_eq!(strategy.delay_for(1), Duration::ZERO);
        assert_eq!(strategy.delay_for(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_jitter_huge_delay_stays_bounded() {
        assert_eq!(JitterStrategy::None.apply(Duration::MAX), Duration::MAX);
        let full = JitterStrategy::Full.apply(Duration::MAX);
        assert!(full <= Duration::from_millis(u64::MAX));
        let equal = JitterStrategy::Equal.apply(Duration::MAX);
        assert!(equal >= Duration::from_millis(u64::MAX / 2));
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(1000);
        assert_eq!(JitterStrategy::None.apply(delay), delay);
        for _ in 0..50 {
            assert!(JitterStrategy::Full.apply(delay) <= delay);
            let equal = JitterStrategy::Equal.apply(delay);
            assert!(equal >= Duration::from_millis(500) && equal <= delay);
        }
        assert_eq!(JitterStrategy::Full.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_validation() {
        assert!(RecoveryStrategy::default().validate("defaults.recovery").is_ok());

        let err = RecoveryStrategy::new()
            .with_backoff_multiplier(0.5)
            .validate("stages.plan.recovery")
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("stages.plan.recovery.backoff_multiplier"));

        let err = RecoveryStrategy::new()
            .with_base_delay(Duration::from_secs(90))
            .validate("r")
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("r.base_delay_seconds"));
    }

    #[test]
    fn test_deserialize_partial() {
        let strategy: RecoveryStrategy =
            serde_json::from_value(serde_json::json!({"max_retries": 7})).unwrap();
        assert_eq!(strategy.max_retries, 7);
        assert_eq!(strategy.timeout(), Duration::from_secs(300));
    }
}
