//! Stage trait and implementations.
//!
//! Stages are the pluggable units of work the supervisor runs. Any `Ok`
//! return is a success; the payload is opaque to the supervisor.

mod context;

pub use context::StageContext;

use crate::core::{StageFailure, StageOutput};
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

/// A unit of work.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Executes one attempt.
    ///
    /// Long-running stages should check
    /// [`StageContext::is_cancelled`] between steps.
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageFailure>;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageFailure> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageFailure> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageFailure> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageFailure> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        (self.func)(ctx)
    }
}

/// An async function-based stage.
pub struct AsyncFnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageFailure>> + Send,
{
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageFailure>> + Send,
{
    /// Creates a new async function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageFailure>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnStage")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Stage for AsyncFnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageFailure>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        (self.func)(ctx.clone()).await
    }
}

/// A stage that succeeds with an empty output.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        Ok(StageOutput::ok_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ctx() -> StageContext {
        StageContext::new("run", "test", 1, Arc::new(serde_json::json!({"title": "card"})))
    }

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("test", |ctx: &StageContext| {
            Ok(StageOutput::ok_value("title", ctx.card()["title"].clone()))
        });
        assert_eq!(stage.name(), "test");

        let output = stage.execute(&ctx()).await.unwrap();
        assert_eq!(output.get_str("title"), Some("card"));
    }

    #[tokio::test]
    async fn test_async_fn_stage() {
        let stage = AsyncFnStage::new("async", |ctx: StageContext| async move {
            if ctx.attempt() == 1 {
                Err(StageFailure::new("flaky", "first attempt"))
            } else {
                Ok(StageOutput::ok_empty())
            }
        });
        assert!(stage.execute(&ctx()).await.is_err());
    }

    #[tokio::test]
    async fn test_noop_stage() {
        let stage = NoOpStage::new("noop");
        assert_eq!(stage.name(), "noop");
        assert!(stage.execute(&ctx()).await.unwrap().is_empty());
    }
}
