//! Run supervision.
//!
//! This module provides:
//! - The [`Supervisor`] facade and its builder
//! - TOML-backed [`SupervisorConfig`]
//! - [`FailureReport`] post-mortems

mod config;
mod report;
#[allow(clippy::module_inception)]
mod supervisor;


pub use config::{
    BreakerOverrides, RecoveryOverrides, StageOverrides, StagePolicy, SupervisorConfig,
};
pub use report::{FailureReport, StageReport};
pub use supervisor::{Supervisor, SupervisorBuilder};
