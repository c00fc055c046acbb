//! Cooperative cancellation of a run.

mod token;

pub use token::CancellationToken;
