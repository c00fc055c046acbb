//! Supervisor configuration and its TOML form.
//!
//! ```toml
//! checkpoint_dir = ".stageguard/checkpoints"
//! jitter = "none"
//!
//! [defaults.recovery]
//! max_retries = 3
//! base_delay_seconds = 1.0
//! backoff_multiplier = 2.0
//! max_delay_seconds = 60.0
//! timeout_seconds = 300.0
//!
//! [defaults.breaker]
//! failure_threshold = 5
//! cooldown_seconds = 60.0
//! half_open_success_threshold = 1
//!
//! [stages.build.recovery]
//! max_retries = 5
//!
//! [[feedback]]
//! upstream = "analyze"
//! dependent = "build"
//! signal_field = "complexity"
//! elevated_values = ["high"]
//! extra_retries = 2
//! ```

use crate::breaker::{BreakerRegistry, CircuitBreakerConfig};
use crate::errors::ConfigError;
use crate::recovery::{FeedbackRule, JitterStrategy, RecoveryEngine, RecoveryStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Recovery and breaker settings for one stage (or the defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    /// Retry policy.
    pub recovery: RecoveryStrategy,
    /// Breaker tuning.
    pub breaker: CircuitBreakerConfig,
}

/// Partial retry policy. Omitted keys inherit `[defaults.recovery]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryOverrides {
    /// Retries allowed after the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Delay before the first retry, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_seconds: Option<f64>,
    /// Backoff factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    /// Delay cap, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<f64>,
    /// Per-attempt timeout, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

impl RecoveryOverrides {
    /// Fills the omitted keys from `base`.
    #[must_use]
    pub fn merged_onto(&self, base: &RecoveryStrategy) -> RecoveryStrategy {
        RecoveryStrategy {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            base_delay_seconds: self.base_delay_seconds.unwrap_or(base.base_delay_seconds),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
            max_delay_seconds: self.max_delay_seconds.unwrap_or(base.max_delay_seconds),
            timeout_seconds: self.timeout_seconds.unwrap_or(base.timeout_seconds),
        }
    }
}

impl From<RecoveryStrategy> for RecoveryOverrides {
    fn from(strategy: RecoveryStrategy) -> Self {
        Self {
            max_retries: Some(strategy.max_retries),
            base_delay_seconds: Some(strategy.base_delay_seconds),
            backoff_multiplier: Some(strategy.backoff_multiplier),
            max_delay_seconds: Some(strategy.max_delay_seconds),
            timeout_seconds: Some(strategy.timeout_seconds),
        }
    }
}

/// Partial breaker tuning. Omitted keys inherit `[defaults.breaker]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerOverrides {
    /// Failures that open the circuit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    /// Open-state cooldown, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<f64>,
    /// Probe successes needed to close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_success_threshold: Option<u32>,
}

impl BreakerOverrides {
    /// Fills the omitted keys from `base`.
    #[must_use]
    pub fn merged_onto(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            cooldown_seconds: self.cooldown_seconds.unwrap_or(base.cooldown_seconds),
            half_open_success_threshold: self
                .half_open_success_threshold
                .unwrap_or(base.half_open_success_threshold),
        }
    }
}

impl From<CircuitBreakerConfig> for BreakerOverrides {
    fn from(config: CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: Some(config.failure_threshold),
            cooldown_seconds: Some(config.cooldown_seconds),
            half_open_success_threshold: Some(config.half_open_success_threshold),
        }
    }
}

/// Per-stage overrides. Omitted sections and keys fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverrides {
    /// Retry policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryOverrides>,
    /// Breaker override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerOverrides>,
}

/// Everything a [`Supervisor`](super::Supervisor) can be tuned with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory of the file checkpoint store; in-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    /// Jitter applied to retry delays.
    pub jitter: JitterStrategy,
    /// Policy for stages without overrides.
    pub defaults: StagePolicy,
    /// Per-stage overrides.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageOverrides>,
    /// Cross-stage feedback rules.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<FeedbackRule>,
}

impl SupervisorConfig {
    /// Creates a config with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document and validates it.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml).map_err(|e| ConfigError::new(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Renders the config as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::new(e.to_string()))
    }

    /// Sets the checkpoint directory.
    #[must_use]
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Sets the jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_default_recovery(mut self, strategy: RecoveryStrategy) -> Self {
        self.defaults.recovery = strategy;
        self
    }

    /// Sets the default breaker tuning.
    #[must_use]
    pub fn with_default_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.defaults.breaker = config;
        self
    }

    /// Overrides the retry policy of one stage.
    #[must_use]
    pub fn with_stage_recovery(
        mut self,
        stage_name: impl Into<String>,
        strategy: RecoveryStrategy,
    ) -> Self {
        self.stages.entry(stage_name.into()).or_default().recovery = Some(strategy.into());
        self
    }

    /// Overrides the breaker tuning of one stage.
    #[must_use]
    pub fn with_stage_breaker(
        mut self,
        stage_name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.stages.entry(stage_name.into()).or_default().breaker = Some(config.into());
        self
    }

    /// Adds a feedback rule.
    #[must_use]
    pub fn with_feedback_rule(mut self, rule: FeedbackRule) -> Self {
        self.feedback.push(rule);
        self
    }

    /// Checks every policy and rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.recovery.validate("defaults.recovery")?;
        self.defaults.breaker.validate("defaults.breaker")?;
        for (name, overrides) in &self.stages {
            if let Some(ref recovery) = overrides.recovery {
                recovery
                    .merged_onto(&self.defaults.recovery)
                    .validate(&format!("stages.{name}.recovery"))?;
            }
            if let Some(ref breaker) = overrides.breaker {
                breaker
                    .merged_onto(&self.defaults.breaker)
                    .validate(&format!("stages.{name}.breaker"))?;
            }
        }
        for (index, rule) in self.feedback.iter().enumerate() {
            let prefix = format!("feedback[{index}]");
            if rule.upstream == rule.dependent {
                return Err(ConfigError::field(
                    format!("{prefix}.dependent"),
                    "must differ from upstream",
                ));
            }
            if rule.elevated_values.is_empty() {
                return Err(ConfigError::field(
                    format!("{prefix}.elevated_values"),
                    "must list at least one value",
                ));
            }
            if !rule.timeout_multiplier.is_finite() || rule.timeout_multiplier < 1.0 {
                return Err(ConfigError::field(
                    format!("{prefix}.timeout_multiplier"),
                    "must be at least 1.0",
                ));
            }
        }
        Ok(())
    }

    /// Builds the recovery engine this config describes.
    #[must_use]
    pub fn recovery_engine(&self) -> RecoveryEngine {
        let mut engine =
            RecoveryEngine::new(self.defaults.recovery.clone()).with_jitter(self.jitter);
        for (name, overrides) in &self.stages {
            if let Some(ref recovery) = overrides.recovery {
                engine = engine.with_stage_strategy(
                    name.clone(),
                    recovery.merged_onto(&self.defaults.recovery),
                );
            }
        }
        for rule in &self.feedback {
            engine = engine.with_feedback_rule(rule.clone());
        }
        engine
    }

    /// Builds the breaker registry this config describes.
    #[must_use]
    pub fn breaker_registry(&self) -> BreakerRegistry {
        let mut registry = BreakerRegistry::new(self.defaults.breaker.clone());
        for (name, overrides) in &self.stages {
            if let Some(ref breaker) = overrides.breaker {
                registry = registry
                    .with_stage_config(name.clone(), breaker.merged_onto(&self.defaults.breaker));
            }
        }
        registry
    }
}
