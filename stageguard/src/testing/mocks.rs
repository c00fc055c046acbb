//! Mock stages and escalation handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::core::{StageFailure, StageOutput};
use crate::recovery::{EscalationHandler, EscalationRequest};
use crate::stages::{Stage, StageContext};

/// A stage that fails a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    failures: u32,
    failure: StageFailure,
    output: StageOutput,
    calls: AtomicU32,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedStage {
    /// Creates a stage failing `failures` times with a retryable error.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        let name = name.into();
        Self {
            failure: StageFailure::new("scripted", format!("{name} failed")),
            name,
            failures,
            output: StageOutput::ok_empty(),
            calls: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Creates a stage that never succeeds.
    #[must_use]
    pub fn always_failing(name: impl Into<String>) -> Self {
        Self::new(name, u32::MAX)
    }

    /// Sets the failure returned while failing.
    #[must_use]
    pub fn with_failure(mut self, failure: StageFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Sets the output returned once succeeding.
    #[must_use]
    pub fn with_output(mut self, output: StageOutput) -> Self {
        self.output = output;
        self
    }

    /// Number of times the stage was invoked.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Attempt numbers seen in the stage context, in call order.
    #[must_use]
    pub fn seen_attempts(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().push(ctx.attempt());
        if call < self.failures {
            Err(self.failure.clone())
        } else {
            Ok(self.output.clone())
        }
    }
}

/// A stage that always fails.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    failure: StageFailure,
}

impl FailingStage {
    /// Creates a stage failing with a non-retryable error.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure: StageFailure::permanent("failing", error),
        }
    }

    /// Creates a stage failing with a retryable error.
    #[must_use]
    pub fn retryable(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure: StageFailure::new("failing", error),
        }
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        Err(self.failure.clone())
    }
}

/// A stage that always succeeds with optional data.
#[derive(Debug)]
pub struct SuccessStage {
    name: String,
    data: HashMap<String, serde_json::Value>,
}

impl SuccessStage {
    /// Creates a new success stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: HashMap::new(),
        }
    }

    /// Adds a value to the output.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

#[async_trait]
impl Stage for SuccessStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        if self.data.is_empty() {
            Ok(StageOutput::ok_empty())
        } else {
            Ok(StageOutput::ok(self.data.clone()))
        }
    }
}

/// A stage that sleeps before succeeding.
#[derive(Debug)]
pub struct SlowStage {
    name: String,
    delay: Duration,
}

impl SlowStage {
    /// Creates a new slow stage.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }

    /// Creates a slow stage with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(StageOutput::ok_empty())
    }
}

/// An escalation handler that records requests and answers with a fixed
/// outcome.
#[derive(Debug)]
pub struct RecordingEscalation {
    outcome: Result<StageOutput, StageFailure>,
    requests: Mutex<Vec<EscalationRequest>>,
}

impl RecordingEscalation {
    /// Handler that recovers every stage with `output`.
    #[must_use]
    pub fn recovering(output: StageOutput) -> Self {
        Self {
            outcome: Ok(output),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Handler that refuses every stage.
    #[must_use]
    pub fn refusing(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(StageFailure::permanent("escalation", message)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<EscalationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl EscalationHandler for RecordingEscalation {
    async fn escalate(&self, request: &EscalationRequest) -> Result<StageOutput, StageFailure> {
        self.requests.lock().push(request.clone());
        self.outcome.clone()
    }
}
