//! Cross-stage feedback: upstream results widening downstream budgets.

use super::RecoveryStrategy;
use serde::{Deserialize, Serialize};

/// Widens a dependent stage's budget when an upstream result carries an
/// elevated signal.
///
/// The signal is read from the upstream payload's `data.<signal_field>`,
/// falling back to a top-level `<signal_field>`. String values compare
/// case-insensitively.
///
/// ```toml
/// [[feedback]]
/// upstream = "analyze"
/// dependent = "build"
/// signal_field = "complexity"
/// elevated_values = ["high", "critical"]
/// extra_retries = 2
/// timeout_multiplier = 2.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRule {
    /// Stage whose result is inspected.
    pub upstream: String,
    /// Stage whose strategy is widened.
    pub dependent: String,
    /// Field holding the signal.
    pub signal_field: String,
    /// Values that count as elevated.
    pub elevated_values: Vec<String>,
    /// Retries added to `max_retries`.
    #[serde(default)]
    pub extra_retries: u32,
    /// Factor applied to the attempt timeout.
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
}

const fn default_timeout_multiplier() -> f64 {
    1.0
}

impl FeedbackRule {
    /// Creates a rule with no widening configured yet.
    #[must_use]
    pub fn new(
        upstream: impl Into<String>,
        dependent: impl Into<String>,
        signal_field: impl Into<String>,
    ) -> Self {
        Self {
            upstream: upstream.into(),
            dependent: dependent.into(),
            signal_field: signal_field.into(),
            elevated_values: Vec::new(),
            extra_retries: 0,
            timeout_multiplier: 1.0,
        }
    }

    /// Adds a value that counts as elevated.
    #[must_use]
    pub fn elevated_on(mut self, value: impl Into<String>) -> Self {
        self.elevated_values.push(value.into());
        self
    }

    /// Sets the extra retries.
    #[must_use]
    pub const fn with_extra_retries(mut self, extra: u32) -> Self {
        self.extra_retries = extra;
        self
    }

    /// Sets the timeout multiplier.
    #[must_use]
    pub const fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// Returns true if `payload` carries an elevated signal.
    #[must_use]
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        let signal = payload
            .get("data")
            .and_then(|data| data.get(&self.signal_field))
            .or_else(|| payload.get(&self.signal_field));
        let Some(signal) = signal else {
            return false;
        };
        let signal = match signal {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.elevated_values
            .iter()
            .any(|value| value.eq_ignore_ascii_case(&signal))
    }

    /// Returns `strategy` widened by this rule.
    #[must_use]
    pub fn widen(&self, strategy: &RecoveryStrategy) -> RecoveryStrategy {
        let mut widened = strategy.clone();
        widened.max_retries = widened.max_retries.saturating_add(self.extra_retries);
        if self.timeout_multiplier.is_finite() && self.timeout_multiplier > 1.0 {
            widened.timeout_seconds = strategy.timeout_seconds * self.timeout_multiplier;
        }
        widened
    }
}
