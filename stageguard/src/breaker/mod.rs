//! Per-stage circuit breaking.
//!
//! A stage that keeps failing trips its breaker; further calls fail fast
//! until a cooldown passes and a probe succeeds. Breakers are independent
//! per stage name, so one broken stage never blocks the others.

#[allow(clippy::module_inception)]
mod breaker;
mod config;
mod registry;

pub use breaker::{CircuitBreaker, CircuitBreakerState, CircuitState, CircuitTransition};
pub use config::CircuitBreakerConfig;
pub use registry::BreakerRegistry;
