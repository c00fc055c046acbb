//! Logging setup.

mod subscriber;

pub use subscriber::{env_filter, init_tracing, run_span, stage_span, LogFormat, LOG_ENV};
