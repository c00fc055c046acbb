//! Per-stage execution health counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution statistics for one stage name over the lifetime of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageHealth {
    /// Attempts started (successful or not).
    pub execution_count: u32,
    /// Attempts that returned an output.
    pub success_count: u32,
    /// Attempts that failed or timed out.
    pub failure_count: u32,
    /// Wall-clock time spent across all attempts.
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the last attempt finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl StageHealth {
    /// Creates empty health counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful attempt.
    pub fn record_success(&mut self, duration: Duration) {
        self.execution_count += 1;
        self.success_count += 1;
        self.total_duration += duration;
        self.consecutive_failures = 0;
        self.last_attempt_at = Some(Utc::now());
    }

    /// Records a failed attempt.
    pub fn record_failure(&mut self, duration: Duration, error: impl Into<String>) {
        self.execution_count += 1;
        self.failure_count += 1;
        self.total_duration += duration;
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
        self.last_attempt_at = Some(Utc::now());
    }

    /// Fraction of attempts that succeeded, 0.0 when nothing ran.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        f64::from(self.success_count) / f64::from(self.execution_count)
    }

    /// Mean attempt duration.
    #[must_use]
    pub fn average_duration(&self) -> Duration {
        if self.execution_count == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.execution_count
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_counters() {
        let mut health = StageHealth::new();
        health.record_failure(Duration::from_millis(10), "boom");
        health.record_failure(Duration::from_millis(10), "boom again");
        assert_eq!(health.consecutive_failures, 2);

        health.record_success(Duration::from_millis(40));

        assert_eq!(health.execution_count, 3);
        assert_eq!(health.success_count, 1);
        assert_eq!(health.failure_count, 2);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_duration, Duration::from_millis(60));
        assert_eq!(health.average_duration(), Duration::from_millis(20));
        assert_eq!(health.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_success_rate_empty() {
        let health = StageHealth::new();
        assert_eq!(health.success_rate(), 0.0);
        assert_eq!(health.average_duration(), Duration::ZERO);
    }

    #[test]
    fn test_serialization_uses_millis() {
        let mut health = StageHealth::new();
        health.record_success(Duration::from_millis(250));
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["total_duration"], serde_json::json!(250));

        let back: StageHealth = serde_json::from_value(json).unwrap();
        assert_eq!(back.total_duration, Duration::from_millis(250));
    }
}
