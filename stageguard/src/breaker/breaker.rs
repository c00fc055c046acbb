//! Per-stage circuit breaker.
//!
//! ```text
//! CLOSED --failure_threshold consecutive failures--> OPEN
//! OPEN --cooldown elapsed, next request--> HALF_OPEN
//! HALF_OPEN --half_open_success_threshold successes--> CLOSED
//! HALF_OPEN --any failure--> OPEN
//! ```
//!
//! State and counters live under one lock, so concurrent callers observe
//! consistent snapshots.

use super::CircuitBreakerConfig;
use crate::errors::CircuitOpenError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally.
    #[default]
    Closed,
    /// Requests are refused until the cooldown elapses.
    Open,
    /// Probe requests are allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Returns the wire name (`"CLOSED"`, `"OPEN"`, `"HALF_OPEN"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change reported by the breaker, for event publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    /// State before the change.
    pub from: CircuitState,
    /// State after the change.
    pub to: CircuitState,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted while CLOSED.
    pub failure_count: u32,
    /// Probe successes counted while HALF_OPEN.
    pub half_open_success_count: u32,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    half_open_success_count: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
}

impl Inner {
    fn cooldown_elapsed(&self, now: Instant, cooldown: Duration) -> bool {
        self.opened_at
            .map_or(true, |opened| now.saturating_duration_since(opened) >= cooldown)
    }

    fn retry_in(&self, now: Instant, cooldown: Duration) -> Duration {
        self.opened_at.map_or(Duration::ZERO, |opened| {
            cooldown.saturating_sub(now.saturating_duration_since(opened))
        })
    }

    fn move_to(&mut self, to: CircuitState) -> Option<CircuitTransition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(CircuitTransition { from, to })
    }

    fn open(&mut self, now: Instant) -> Option<CircuitTransition> {
        self.opened_at = Some(now);
        self.opened_at_wall = Some(Utc::now());
        self.half_open_success_count = 0;
        self.move_to(CircuitState::Open)
    }
}

/// Tripwire guarding one stage name.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a CLOSED breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Stage name this breaker guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of state and counters.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_success_count: inner.half_open_success_count,
            opened_at: inner.opened_at_wall,
        }
    }

    /// Returns true if a request may proceed now.
    pub fn should_allow_request(&self) -> bool {
        self.guard_at(Instant::now()).is_ok()
    }

    /// Admits or refuses a request.
    ///
    /// An OPEN breaker whose cooldown elapsed flips to HALF_OPEN and admits
    /// the request; the flip is reported once and repeated calls stay
    /// HALF_OPEN. Admission never consumes a probe slot.
    pub fn guard(&self) -> Result<Option<CircuitTransition>, CircuitOpenError> {
        self.guard_at(Instant::now())
    }

    /// [`guard`](Self::guard) with an explicit clock.
    pub fn guard_at(&self, now: Instant) -> Result<Option<CircuitTransition>, CircuitOpenError> {
        let cooldown = self.config.cooldown();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(None),
            CircuitState::Open if inner.cooldown_elapsed(now, cooldown) => {
                inner.half_open_success_count = 0;
                let transition = inner.move_to(CircuitState::HalfOpen);
                info!(stage = %self.name, "Circuit half-open, allowing probe");
                Ok(transition)
            }
            CircuitState::Open => {
                let mut err = CircuitOpenError::new(&self.name)
                    .with_retry_in(inner.retry_in(now, cooldown));
                if let Some(opened_at) = inner.opened_at_wall {
                    err = err.with_opened_at(opened_at);
                }
                Err(err)
            }
        }
    }

    /// Returns true if [`guard_at`](Self::guard_at) would admit a request,
    /// without changing state.
    #[must_use]
    pub fn would_allow_at(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner.cooldown_elapsed(now, self.config.cooldown()),
        }
    }

    /// Remaining cooldown, zero unless OPEN.
    #[must_use]
    pub fn retry_in(&self) -> Duration {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            inner.retry_in(Instant::now(), self.config.cooldown())
        } else {
            Duration::ZERO
        }
    }

    /// Records a successful attempt.
    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_success_count += 1;
                if inner.half_open_success_count >= self.config.half_open_success_threshold {
                    inner.failure_count = 0;
                    inner.half_open_success_count = 0;
                    inner.opened_at = None;
                    inner.opened_at_wall = None;
                    info!(stage = %self.name, "Circuit closed after successful probe");
                    return inner.move_to(CircuitState::Closed);
                }
                None
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Records a failed attempt.
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        self.record_failure_at(Instant::now())
    }

    /// [`record_failure`](Self::record_failure) with an explicit clock.
    pub fn record_failure_at(&self, now: Instant) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        stage = %self.name,
                        failures = inner.failure_count,
                        cooldown_seconds = self.config.cooldown_seconds,
                        "Circuit opened"
                    );
                    return inner.open(now);
                }
                None
            }
            CircuitState::HalfOpen => {
                warn!(stage = %self.name, "Probe failed, circuit re-opened");
                inner.open(now)
            }
            CircuitState::Open => None,
        }
    }

    /// Forces the breaker CLOSED and clears its counters.
    pub fn reset(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.half_open_success_count = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.move_to(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "build",
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_cooldown(Duration::from_secs(cooldown_secs))
                .with_half_open_success_threshold(probes),
        )
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = breaker(3, 30, 1);
        let now = Instant::now();
        assert!(breaker.record_failure_at(now).is_none());
        assert!(breaker.record_failure_at(now).is_none());
        assert_eq!(breaker.state(), CircuitState::Closed);

        let transition = breaker.record_failure_at(now).unwrap();
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
        assert!(breaker.snapshot().opened_at.is_some());
    }

    #[test]
    fn test_refuses_until_cooldown() {
        let breaker = breaker(1, 30, 1);
        let opened = Instant::now();
        breaker.record_failure_at(opened);

        let err = breaker.guard_at(opened + Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.stage, "build");
        assert_eq!(err.retry_in, Some(Duration::from_secs(20)));
        assert!(!breaker.would_allow_at(opened + Duration::from_secs(29)));

        let transition = breaker.guard_at(opened + Duration::from_secs(30)).unwrap();
        assert_eq!(
            transition,
            Some(CircuitTransition {
                from: CircuitState::Open,
                to: CircuitState::HalfOpen,
            })
        );
        // Idempotent flip.
        assert_eq!(breaker.guard_at(opened + Duration::from_secs(31)).unwrap(), None);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().half_open_success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(2, 0, 3);
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        breaker.guard_at(now).unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        let transition = breaker.record_failure_at(now).unwrap();
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(breaker.snapshot().half_open_success_count, 0);
    }

    #[test]
    fn test_half_open_closes_after_probe_successes() {
        let breaker = breaker(1, 0, 2);
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.guard_at(now).unwrap();

        assert!(breaker.record_success().is_none());
        assert_eq!(breaker.snapshot().half_open_success_count, 1);
        let transition = breaker.record_success().unwrap();
        assert_eq!(transition.to, CircuitState::Closed);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.half_open_success_count, 0);
        assert!(snapshot.opened_at.is_none());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3, 30, 1);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);
    }

    #[test]
    fn test_reset() {
        let breaker = breaker(1, 300, 1);
        breaker.record_failure();
        assert!(!breaker.should_allow_request());
        assert!(breaker.retry_in() > Duration::ZERO);

        assert_eq!(breaker.reset().unwrap().to, CircuitState::Closed);
        assert!(breaker.should_allow_request());
        assert!(breaker.reset().is_none());
        assert_eq!(breaker.retry_in(), Duration::ZERO);
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            serde_json::json!("HALF_OPEN")
        );
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
    }
}
