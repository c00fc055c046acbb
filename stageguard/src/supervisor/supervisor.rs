//! The orchestration facade.

use super::{FailureReport, SupervisorConfig};
use crate::breaker::{BreakerRegistry, CircuitBreakerState, CircuitState, CircuitTransition};
use crate::cancellation::CancellationToken;
use crate::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use crate::core::{
    AttemptRecord, PipelineState, StageFailure, StageHealth, StageOutput, StageStatus,
};
use crate::errors::{
    CircuitOpenError, ConfigError, RetryExhaustedError, StageExecutionError, StageguardError,
};
use crate::events::{EventBus, PipelineEvent};
use crate::observability::{run_span, stage_span};
use crate::machine::{
    PersistenceStatus, StateMachine, StateStackEntry, TransitionRecord, TransitionTable,
};
use crate::recovery::{
    EscalationHandler, EscalationRequest, FailFastEscalation, RecoveryAction, RecoveryEngine,
};
use crate::stages::{Stage, StageContext};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Builds a [`Supervisor`] for a new run, or resumes one from its
/// checkpoint.
#[derive(Default)]
pub struct SupervisorBuilder {
    run_id: Option<String>,
    config: SupervisorConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    escalation: Option<Arc<dyn EscalationHandler>>,
    events: Option<EventBus>,
    cancellation: Option<Arc<CancellationToken>>,
    table: Option<Arc<TransitionTable>>,
    card: serde_json::Value,
}

impl SupervisorBuilder {
    /// Creates a builder with default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run id. New runs default to a UUIDv7.
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `store` instead of the store implied by the config.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the escalation handler. Defaults to [`FailFastEscalation`].
    #[must_use]
    pub fn escalation(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalation = Some(handler);
        self
    }

    /// Publishes events on `events`.
    #[must_use]
    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Shares an existing cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Validates transitions against `table`.
    #[must_use]
    pub fn transition_table(mut self, table: TransitionTable) -> Self {
        self.table = Some(Arc::new(table));
        self
    }

    /// Sets the work item stages receive.
    #[must_use]
    pub fn card(mut self, card: serde_json::Value) -> Self {
        self.card = card;
        self
    }

    /// Starts a new run in IDLE and writes its first checkpoint.
    pub fn build(self) -> Result<Supervisor, StageguardError> {
        self.config.validate()?;
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let store = self.resolve_store();
        let mut machine = StateMachine::new(&run_id);
        machine = self.attach(machine, store);
        if let Err(err) = machine.save_checkpoint() {
            warn!(run_id = %run_id, error = %err, "Initial checkpoint failed");
        }
        info!(run_id = %run_id, "Run created");
        Ok(self.finish(run_id, machine))
    }

    /// Resumes the run named by [`run_id`](Self::run_id) from its
    /// checkpoint.
    ///
    /// State, stage statuses, health and latest results are restored. A run
    /// interrupted mid-flight, or one that FAILED, moves to RECOVERING;
    /// stages caught RUNNING go back to PENDING.
    pub fn resume(self) -> Result<Supervisor, StageguardError> {
        self.config.validate()?;
        let run_id = self
            .run_id
            .clone()
            .ok_or_else(|| ConfigError::field("run_id", "required to resume a run"))?;
        let store = self.resolve_store();
        let checkpoint = store
            .load(&run_id)?
            .ok_or_else(|| StageguardError::CheckpointNotFound(run_id.clone()))?;
        info!(
            run_id = %run_id,
            state = %checkpoint.fsm_state,
            sequence = checkpoint.sequence,
            "Resuming run from checkpoint"
        );

        let mut machine = self.attach(StateMachine::from_checkpoint(checkpoint), store);
        let interrupted: Vec<String> = machine
            .stage_statuses()
            .iter()
            .filter(|(_, status)| **status == StageStatus::Running)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &interrupted {
            machine.set_stage_status(name, StageStatus::Pending);
        }

        let state = machine.current_state();
        if state != PipelineState::Recovering
            && (state.is_interrupted() || state == PipelineState::Failed)
        {
            machine.transition(
                PipelineState::Recovering,
                "resume",
                "resumed from checkpoint",
                serde_json::Map::new(),
            )?;
        }
        Ok(self.finish(run_id, machine))
    }

    fn resolve_store(&self) -> Arc<dyn CheckpointStore> {
        if let Some(ref store) = self.store {
            return Arc::clone(store);
        }
        match self.config.checkpoint_dir {
            Some(ref dir) => Arc::new(FileCheckpointStore::new(dir)),
            None => Arc::new(InMemoryCheckpointStore::new()),
        }
    }

    fn attach(&self, machine: StateMachine, store: Arc<dyn CheckpointStore>) -> StateMachine {
        let mut machine = machine
            .with_store(store)
            .with_event_bus(self.events.clone().unwrap_or_default());
        if let Some(ref table) = self.table {
            machine = machine.with_transition_table(Arc::clone(table));
        }
        machine
    }

    fn finish(self, run_id: String, machine: StateMachine) -> Supervisor {
        let events = machine.events().clone();
        Supervisor {
            run_id,
            breakers: self.config.breaker_registry(),
            recovery: self.config.recovery_engine(),
            machine: Mutex::new(machine),
            escalation: self
                .escalation
                .unwrap_or_else(|| Arc::new(FailFastEscalation)),
            events,
            cancellation: self.cancellation.unwrap_or_default(),
            attempts: Mutex::new(HashMap::new()),
            card: Arc::new(self.card),
        }
    }
}

/// Runs stages under breaker guard, retry loop and state recording.
///
/// One supervisor owns the state machine of one run. State machine
/// mutations are serialized behind a lock that is never held across an
/// await, so independent stages may run concurrently.
pub struct Supervisor {
    run_id: String,
    machine: Mutex<StateMachine>,
    breakers: BreakerRegistry,
    recovery: RecoveryEngine,
    escalation: Arc<dyn EscalationHandler>,
    events: EventBus,
    cancellation: Arc<CancellationToken>,
    attempts: Mutex<HashMap<String, Vec<AttemptRecord>>>,
    card: Arc<serde_json::Value>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("run_id", &self.run_id)
            .field("state", &self.current_state())
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Starts building a supervisor.
    #[must_use]
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Event bus of the run.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// The recovery engine, for runtime strategy overrides.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// Requests cancellation of the run.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancellation.cancel(reason);
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancellation)
    }

    /// Applies a primary-state transition.
    pub fn transition(
        &self,
        to: PipelineState,
        event: &str,
        reason: &str,
    ) -> Result<TransitionRecord, StageguardError> {
        Ok(self
            .machine
            .lock()
            .transition(to, event, reason, serde_json::Map::new())?)
    }

    /// Seeds PENDING statuses for `stage_names`.
    pub fn register_stages<I, S>(&self, stage_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.machine.lock().register_stages(stage_names);
    }

    /// Runs one stage to success, escalation or abort.
    ///
    /// 1. A refusing breaker fails fast with [`CircuitOpenError`] and the
    ///    stage is not invoked.
    /// 2. A success updates health and breaker, pushes STAGE_COMPLETED with
    ///    the full output and returns it.
    /// 3. A failure updates health and breaker, pushes STAGE_FAILED and asks
    ///    the recovery engine whether to retry, escalate or abort.
    ///
    /// Feedback rules targeting the stage are applied before the first
    /// attempt. The primary state is left to the caller.
    pub async fn execute_stage(
        &self,
        stage_name: &str,
        stage: &dyn Stage,
    ) -> Result<StageOutput, StageguardError> {
        let breaker = self.breakers.get_or_create(stage_name);
        let widened = self.recovery.apply_feedback(stage_name, |upstream| {
            self.machine.lock().get_latest_result(upstream).cloned()
        });
        if let Some(ref strategy) = widened {
            info!(
                run_id = %self.run_id,
                stage = %stage_name,
                max_retries = strategy.max_retries,
                timeout_seconds = strategy.timeout_seconds,
                "Upstream feedback widened recovery strategy"
            );
        }
        let strategy = self.recovery.strategy_for(stage_name);
        let timeout = strategy.timeout();

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if self.cancellation.is_cancelled() {
                return Err(self.cancelled(stage_name, attempts));
            }

            match breaker.guard() {
                Ok(transition) => self.publish_circuit(stage_name, transition),
                Err(err) => {
                    warn!(
                        run_id = %self.run_id,
                        stage = %stage_name,
                        retry_in_ms = err.retry_in.map_or(0, millis),
                        "Circuit open, stage not invoked"
                    );
                    // A refused first attempt never ran; leave status and checkpoint alone.
                    if !attempts.is_empty() {
                        self.set_status(stage_name, StageStatus::Failed);
                    }
                    self.log_attempts(stage_name, &attempts);
                    return Err(err.with_attempts(attempts).into());
                }
            }
            if attempt == 1 {
                self.set_status(stage_name, StageStatus::Running);
            }

            let upstream = Arc::new(self.machine.lock().get_all_latest_results());
            let ctx = StageContext::new(&self.run_id, stage_name, attempt, Arc::clone(&self.card))
                .with_upstream(upstream)
                .with_cancellation(Arc::clone(&self.cancellation));

            debug!(run_id = %self.run_id, stage = %stage_name, attempt, "Attempt started");
            let started_at = Utc::now();
            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                () = self.cancellation.cancelled() => {
                    Err(StageFailure::cancelled(self.cancel_reason()))
                }
                result = tokio::time::timeout(
                    timeout,
                    stage.execute(&ctx).instrument(stage_span(&self.run_id, stage_name, attempt)),
                ) => {
                    result.unwrap_or_else(|_| Err(StageFailure::timeout(timeout)))
                }
            };
            let duration = start.elapsed();
            let mut record = AttemptRecord {
                stage_name: stage_name.to_string(),
                attempt,
                started_at,
                duration_ms: millis(duration),
                failure: None,
                decision: None,
            };

            let failure = match outcome {
                Ok(output) => {
                    {
                        let mut machine = self.machine.lock();
                        machine.record_success(stage_name, duration);
                        machine.push_entry(StateStackEntry::stage_completed(
                            stage_name,
                            &output,
                            duration,
                            attempt - 1,
                        ));
                        machine.set_stage_status(stage_name, StageStatus::Completed);
                    }
                    let transition = breaker.record_success();
                    self.publish_circuit(stage_name, transition);
                    attempts.push(record);
                    self.log_attempts(stage_name, &attempts);
                    info!(
                        run_id = %self.run_id,
                        stage = %stage_name,
                        attempt,
                        duration_ms = millis(duration),
                        "Stage completed"
                    );
                    return Ok(output);
                }
                Err(failure) => failure,
            };

            if self.cancellation.is_cancelled() {
                record.failure = Some(failure);
                attempts.push(record);
                return Err(self.cancelled(stage_name, attempts));
            }

            let err = StageExecutionError::new(stage_name, attempt, failure.clone());
            warn!(run_id = %self.run_id, error = %err, "Stage attempt failed");
            {
                let mut machine = self.machine.lock();
                machine.record_failure(stage_name, duration, failure.message.clone());
                machine.push_entry(StateStackEntry::stage_failed(
                    stage_name,
                    &failure,
                    attempt - 1,
                ));
            }
            let transition = breaker.record_failure();
            self.publish_circuit(stage_name, transition);

            let action = self.recovery.decide(stage_name, attempt, &failure, &breaker);
            record.failure = Some(failure.clone());
            record.decision = Some(action.to_string());
            attempts.push(record);

            match action {
                RecoveryAction::RetryAfter(delay) => {
                    debug!(
                        run_id = %self.run_id,
                        stage = %stage_name,
                        attempt,
                        delay_ms = millis(delay),
                        "Retry scheduled"
                    );
                    self.events.publish(PipelineEvent::RetryScheduled {
                        run_id: self.run_id.clone(),
                        stage_name: stage_name.to_string(),
                        attempt,
                        delay_ms: millis(delay),
                    });
                    tokio::select! {
                        biased;
                        () = self.cancellation.cancelled() => {
                            return Err(self.cancelled(stage_name, attempts));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::Abort => {
                    warn!(
                        run_id = %self.run_id,
                        stage = %stage_name,
                        attempts = attempts.len(),
                        "Circuit opened during retries, aborting stage"
                    );
                    self.set_status(stage_name, StageStatus::Failed);
                    self.log_attempts(stage_name, &attempts);
                    let snapshot = breaker.snapshot();
                    let mut err = CircuitOpenError::new(stage_name)
                        .with_retry_in(breaker.retry_in())
                        .with_attempts(attempts);
                    if let Some(opened_at) = snapshot.opened_at {
                        err = err.with_opened_at(opened_at);
                    }
                    return Err(err.into());
                }
                RecoveryAction::Escalate => {
                    return self.escalate(stage_name, failure, attempts).await;
                }
            }
        }
    }

    /// Runs independent stages concurrently.
    ///
    /// Results come back in input order. The primary state is left to the
    /// caller.
    pub async fn execute_parallel(
        &self,
        stages: &[Arc<dyn Stage>],
    ) -> Vec<(String, Result<StageOutput, StageguardError>)> {
        let runs = stages.iter().map(|stage| async move {
            let name = stage.name().to_string();
            let result = self.execute_stage(&name, stage.as_ref()).await;
            (name, result)
        });
        join_all(runs).await
    }

    /// Drives the run through `stages` in order.
    ///
    /// ```text
    /// IDLE -> ANALYZING -> PLANNING -> (STAGE_RUNNING -> STAGE_COMPLETED)* -> COMPLETED
    /// ```
    ///
    /// Stages already COMPLETED (from a resumed checkpoint) are skipped. A
    /// fatal stage error moves the run through STAGE_FAILED to FAILED and is
    /// returned; cancellation moves it to ABORTED. COMPLETED and ABORTED
    /// runs have their checkpoint archived. Returns the latest output of
    /// every stage.
    pub async fn run(
        &self,
        stages: &[Arc<dyn Stage>],
    ) -> Result<HashMap<String, StageOutput>, StageguardError> {
        self.drive(stages).instrument(run_span(&self.run_id)).await
    }

    async fn drive(
        &self,
        stages: &[Arc<dyn Stage>],
    ) -> Result<HashMap<String, StageOutput>, StageguardError> {
        self.register_stages(stages.iter().map(|s| s.name().to_string()));

        match self.current_state() {
            PipelineState::Idle => {
                self.transition(PipelineState::Analyzing, "run.start", "")?;
                self.transition(PipelineState::Planning, "run.plan", "")?;
            }
            PipelineState::Completed => return Ok(self.get_all_stage_outputs()),
            PipelineState::Aborted => {
                return Err(StageguardError::Cancelled(format!(
                    "run '{}' was aborted",
                    self.run_id
                )))
            }
            PipelineState::Recovering => {}
            _ => {
                self.transition(PipelineState::Recovering, "run.recover", "")?;
            }
        }

        for stage in stages {
            let name = stage.name();
            if self.stage_status(name) == Some(StageStatus::Completed) {
                debug!(run_id = %self.run_id, stage = %name, "Stage already completed, skipping");
                continue;
            }
            if self.cancellation.is_cancelled() {
                return Err(self.abort_run());
            }

            self.machine.lock().transition(
                PipelineState::StageRunning,
                "stage.start",
                name,
                stage_metadata(name),
            )?;
            match self.execute_stage(name, stage.as_ref()).await {
                Ok(_) => {
                    self.machine.lock().transition(
                        PipelineState::StageCompleted,
                        "stage.complete",
                        name,
                        stage_metadata(name),
                    )?;
                }
                Err(StageguardError::Cancelled(_)) => return Err(self.abort_run()),
                Err(err) => {
                    error!(run_id = %self.run_id, stage = %name, error = %err, "Stage failed fatally");
                    let mut machine = self.machine.lock();
                    machine.transition(
                        PipelineState::StageFailed,
                        "stage.fail",
                        &err.to_string(),
                        stage_metadata(name),
                    )?;
                    machine.transition(
                        PipelineState::Failed,
                        "run.fail",
                        name,
                        serde_json::Map::new(),
                    )?;
                    return Err(err);
                }
            }
        }

        self.transition(PipelineState::Completed, "run.complete", "")?;
        self.archive();
        info!(run_id = %self.run_id, stages = stages.len(), "Run completed");
        Ok(self.get_all_stage_outputs())
    }

    /// Latest result payload of `stage_name`.
    #[must_use]
    pub fn get_stage_result(&self, stage_name: &str) -> Option<serde_json::Value> {
        self.machine.lock().get_latest_result(stage_name).cloned()
    }

    /// Latest output of `stage_name`.
    #[must_use]
    pub fn get_stage_output(&self, stage_name: &str) -> Option<StageOutput> {
        self.machine
            .lock()
            .get_latest_result(stage_name)
            .map(StageOutput::from_payload)
    }

    /// Latest result payload of every stage.
    #[must_use]
    pub fn get_all_stage_results(&self) -> HashMap<String, serde_json::Value> {
        self.machine.lock().get_all_latest_results()
    }

    /// Latest output of every stage.
    #[must_use]
    pub fn get_all_stage_outputs(&self) -> HashMap<String, StageOutput> {
        self.get_all_stage_results()
            .iter()
            .map(|(name, payload)| (name.clone(), StageOutput::from_payload(payload)))
            .collect()
    }

    /// Breaker state of `stage_name`; CLOSED for stages never run.
    #[must_use]
    pub fn get_circuit_state(&self, stage_name: &str) -> CircuitState {
        self.breakers
            .get(stage_name)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Breaker snapshot of `stage_name`.
    #[must_use]
    pub fn circuit_snapshot(&self, stage_name: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(stage_name).map(|b| b.snapshot())
    }

    /// Forces the breaker of `stage_name` CLOSED. Returns false if the
    /// stage has no breaker yet.
    pub fn reset_circuit(&self, stage_name: &str) -> bool {
        let Some(breaker) = self.breakers.get(stage_name) else {
            return false;
        };
        let transition = breaker.reset();
        info!(run_id = %self.run_id, stage = %stage_name, "Circuit reset by operator");
        self.publish_circuit(stage_name, transition);
        true
    }

    /// Health of `stage_name`.
    #[must_use]
    pub fn get_stage_health(&self, stage_name: &str) -> Option<StageHealth> {
        self.machine.lock().stage_health(stage_name).cloned()
    }

    /// Status of `stage_name`.
    #[must_use]
    pub fn stage_status(&self, stage_name: &str) -> Option<StageStatus> {
        self.machine.lock().stage_status(stage_name)
    }

    /// Current primary state.
    #[must_use]
    pub fn current_state(&self) -> PipelineState {
        self.machine.lock().current_state()
    }

    /// Accepted transitions of this process, oldest first.
    #[must_use]
    pub fn transition_history(&self) -> Vec<TransitionRecord> {
        self.machine.lock().history().to_vec()
    }

    /// Every attempt of `stage_name` in this process, oldest first.
    #[must_use]
    pub fn attempt_history(&self, stage_name: &str) -> Vec<AttemptRecord> {
        self.attempts
            .lock()
            .get(stage_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Current checkpoint as it would be written.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        self.machine.lock().checkpoint()
    }

    /// Whether checkpoints are being written.
    #[must_use]
    pub fn persistence_status(&self) -> PersistenceStatus {
        self.machine.lock().persistence_status().clone()
    }

    /// Re-enables checkpoint writes after a failure and flushes.
    pub fn restore_persistence(&self) -> Result<(), StageguardError> {
        Ok(self.machine.lock().restore_persistence()?)
    }

    /// Per-stage attempt history, health and breaker state.
    #[must_use]
    pub fn failure_report(&self) -> FailureReport {
        let (state, statuses, health) = {
            let machine = self.machine.lock();
            (
                machine.current_state(),
                machine.stage_statuses().clone(),
                machine.all_health().clone(),
            )
        };
        let attempts = self.attempts.lock().clone();
        FailureReport::build(
            &self.run_id,
            state,
            &statuses,
            &health,
            &attempts,
            &self.breakers.snapshot(),
        )
    }

    async fn escalate(
        &self,
        stage_name: &str,
        last_failure: StageFailure,
        attempts: Vec<AttemptRecord>,
    ) -> Result<StageOutput, StageguardError> {
        let health = self.get_stage_health(stage_name).unwrap_or_default();
        let attempt_count = u32::try_from(attempts.len()).unwrap_or(u32::MAX);
        warn!(
            run_id = %self.run_id,
            stage = %stage_name,
            attempts = attempt_count,
            last_error = %last_failure,
            "Escalating stage"
        );
        self.events.publish(PipelineEvent::Escalated {
            run_id: self.run_id.clone(),
            stage_name: stage_name.to_string(),
            attempts: attempt_count,
        });
        self.log_attempts(stage_name, &attempts);

        let request = EscalationRequest {
            run_id: self.run_id.clone(),
            stage_name: stage_name.to_string(),
            last_failure,
            attempts,
            health,
        };
        let outcome = self.escalation.escalate(&request).await;
        match outcome {
            Ok(output) => {
                info!(run_id = %self.run_id, stage = %stage_name, "Escalation recovered stage");
                let mut machine = self.machine.lock();
                machine.push_entry(StateStackEntry::stage_completed(
                    stage_name,
                    &output,
                    Duration::ZERO,
                    attempt_count,
                ));
                machine.set_stage_status(stage_name, StageStatus::Completed);
                Ok(output)
            }
            Err(escalation_error) => {
                self.set_status(stage_name, StageStatus::Failed);
                let EscalationRequest {
                    last_failure,
                    attempts,
                    health,
                    ..
                } = request;
                Err(RetryExhaustedError::new(stage_name, last_failure, attempts)
                    .with_escalation_error(escalation_error.to_string())
                    .with_health(health)
                    .into())
            }
        }
    }

    fn cancelled(&self, stage_name: &str, attempts: Vec<AttemptRecord>) -> StageguardError {
        let reason = self.cancel_reason();
        info!(run_id = %self.run_id, stage = %stage_name, reason = %reason, "Stage cancelled");
        self.set_status(stage_name, StageStatus::Pending);
        self.log_attempts(stage_name, &attempts);
        StageguardError::Cancelled(reason)
    }

    fn cancel_reason(&self) -> String {
        self.cancellation
            .reason()
            .unwrap_or_else(|| "cancelled".to_string())
    }

    fn abort_run(&self) -> StageguardError {
        let reason = self.cancel_reason();
        if let Err(err) = self.transition(PipelineState::Aborted, "run.abort", &reason) {
            warn!(run_id = %self.run_id, error = %err, "Could not abort run");
        } else {
            self.archive();
        }
        StageguardError::Cancelled(reason)
    }

    fn archive(&self) {
        if let Err(err) = self.machine.lock().archive_checkpoint() {
            warn!(run_id = %self.run_id, error = %err, "Checkpoint archive failed");
        }
    }

    fn set_status(&self, stage_name: &str, status: StageStatus) {
        self.machine.lock().set_stage_status(stage_name, status);
    }

    fn log_attempts(&self, stage_name: &str, attempts: &[AttemptRecord]) {
        if attempts.is_empty() {
            return;
        }
        self.attempts
            .lock()
            .entry(stage_name.to_string())
            .or_default()
            .extend_from_slice(attempts);
    }

    fn publish_circuit(&self, stage_name: &str, transition: Option<CircuitTransition>) {
        if let Some(CircuitTransition { from, to }) = transition {
            self.events.publish(PipelineEvent::CircuitChanged {
                run_id: self.run_id.clone(),
                stage_name: stage_name.to_string(),
                from,
                to,
            });
        }
    }
}

fn stage_metadata(stage_name: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut metadata = serde_json::Map::new();
    metadata.insert("stage_name".to_string(), serde_json::json!(stage_name));
    metadata
}

#[allow(clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
