//! Retry policy and escalation.
//!
//! After every failed attempt the supervisor asks the [`RecoveryEngine`]
//! for a [`RecoveryAction`]. Once the budget is spent the stage goes to an
//! [`EscalationHandler`].

mod engine;
mod escalation;
mod feedback;
mod strategy;

pub use engine::{RecoveryAction, RecoveryEngine};
pub use escalation::{EscalationHandler, EscalationRequest, FailFastEscalation};
pub use feedback::FeedbackRule;
pub use strategy::{JitterStrategy, RecoveryStrategy};
