//! The pushdown state machine of one run.

use super::{StateStack, StateStackEntry, TransitionTable};
use crate::checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION};
use crate::core::{PipelineState, StageHealth, StageStatus};
use crate::errors::{CheckpointIoError, IllegalTransitionError};
use crate::events::{EventBus, PipelineEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Audit record of one accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    /// State before.
    pub from: PipelineState,
    /// State after.
    pub to: PipelineState,
    /// Event that triggered it.
    pub event: String,
    /// Free-form reason.
    pub reason: String,
    /// Caller-supplied metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// When it was applied.
    pub timestamp: DateTime<Utc>,
}

/// Whether checkpoints are currently being written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistenceStatus {
    /// Every mutation is written through.
    Healthy,
    /// A write failed; the run continues in memory only.
    Degraded {
        /// The failed write's error.
        error: String,
        /// When writes stopped.
        since: DateTime<Utc>,
    },
}

impl PersistenceStatus {
    /// Returns true once a write has failed.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Primary state, transition audit log, state stack, stage statuses and
/// per-stage health of one run.
///
/// Every accepted transition, push, pop and stage status change writes the
/// derived [`Checkpoint`] through the attached store. A failed write
/// degrades the machine to memory-only; in-memory state is never dropped.
pub struct StateMachine {
    run_id: String,
    state: PipelineState,
    table: Arc<TransitionTable>,
    history: Vec<TransitionRecord>,
    stack: StateStack,
    stage_statuses: BTreeMap<String, StageStatus>,
    health: HashMap<String, StageHealth>,
    sequence: u64,
    store: Option<Arc<dyn CheckpointStore>>,
    persistence: PersistenceStatus,
    events: EventBus,
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("stack_depth", &self.stack.len())
            .field("stage_statuses", &self.stage_statuses)
            .field("persistent", &self.store.is_some())
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl StateMachine {
    /// Creates an IDLE machine with the default transition table and no
    /// store.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: PipelineState::Idle,
            table: Arc::new(TransitionTable::default()),
            history: Vec::new(),
            stack: StateStack::new(),
            stage_statuses: BTreeMap::new(),
            health: HashMap::new(),
            sequence: 0,
            store: None,
            persistence: PersistenceStatus::Healthy,
            events: EventBus::default(),
        }
    }

    /// Rebuilds a machine from a loaded checkpoint.
    ///
    /// State, stage statuses, health and the write sequence are restored;
    /// each latest result is pushed back as a STAGE_COMPLETED entry marked
    /// restored. The audit log starts empty.
    #[must_use]
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        let mut machine = Self::new(checkpoint.run_id);
        machine.state = checkpoint.fsm_state;
        machine.sequence = checkpoint.sequence;
        machine.stage_statuses = checkpoint.stage_statuses;
        machine.health = checkpoint.stage_health.into_iter().collect();
        for (stage_name, payload) in checkpoint.latest_results {
            machine
                .stack
                .push(StateStackEntry::restored(&stage_name, payload));
        }
        machine
    }

    /// Writes checkpoints through `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publishes events on `events`.
    #[must_use]
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Validates transitions against `table`.
    #[must_use]
    pub fn with_transition_table(mut self, table: Arc<TransitionTable>) -> Self {
        self.table = table;
        self
    }

    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Current primary state.
    #[must_use]
    pub const fn current_state(&self) -> PipelineState {
        self.state
    }

    /// Transition table in use.
    #[must_use]
    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Accepted transitions, oldest first.
    #[must_use]
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// The state stack.
    #[must_use]
    pub const fn stack(&self) -> &StateStack {
        &self.stack
    }

    /// Event bus the machine publishes on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Applies `to` if the table allows `current -> to`.
    ///
    /// On success the audit log grows by one record and a checkpoint is
    /// written. On rejection nothing changes.
    pub fn transition(
        &mut self,
        to: PipelineState,
        event: &str,
        reason: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<TransitionRecord, IllegalTransitionError> {
        let from = self.state;
        if !self.table.allows(from, to) {
            warn!(
                run_id = %self.run_id,
                from = %from,
                to = %to,
                event = %event,
                "Rejected illegal transition"
            );
            return Err(IllegalTransitionError::new(
                from,
                to,
                event,
                self.table.allowed_from(from),
            ));
        }

        let record = TransitionRecord {
            from,
            to,
            event: event.to_string(),
            reason: reason.to_string(),
            metadata,
            timestamp: Utc::now(),
        };
        self.state = to;
        self.history.push(record.clone());
        info!(
            run_id = %self.run_id,
            from = %from,
            to = %to,
            event = %event,
            reason = %reason,
            "State transition"
        );
        self.events.publish(PipelineEvent::Transitioned {
            run_id: self.run_id.clone(),
            from,
            to,
            event: record.event.clone(),
            reason: record.reason.clone(),
            at: record.timestamp,
        });
        self.persist();
        Ok(record)
    }

    /// Appends `(state, context)` to the stack. Always succeeds.
    ///
    /// Returns the stack depth after the push.
    pub fn push_state(
        &mut self,
        state: PipelineState,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> usize {
        self.push_entry(StateStackEntry::new(state, context))
    }

    /// Appends a prepared entry. Always succeeds.
    pub fn push_entry(&mut self, entry: StateStackEntry) -> usize {
        let state = entry.state;
        let stage_name = entry.stage_name().map(String::from);
        self.stack.push(entry);
        let depth = self.stack.len();
        debug!(run_id = %self.run_id, state = %state, stage = ?stage_name, depth, "Pushed state");
        self.events.publish(PipelineEvent::Pushed {
            run_id: self.run_id.clone(),
            state,
            stage_name,
            depth,
        });
        self.persist();
        depth
    }

    /// Removes the top entry for rollback, `None` when the stack is empty.
    pub fn pop_state(&mut self) -> Option<StateStackEntry> {
        let entry = self.stack.pop()?;
        let depth = self.stack.len();
        info!(
            run_id = %self.run_id,
            state = %entry.state,
            stage = ?entry.stage_name(),
            depth,
            "Popped state"
        );
        self.events.publish(PipelineEvent::Popped {
            run_id: self.run_id.clone(),
            state: entry.state,
            stage_name: entry.stage_name().map(String::from),
            depth,
        });
        self.persist();
        Some(entry)
    }

    /// Most recent STAGE_COMPLETED payload of `stage_name`.
    #[must_use]
    pub fn get_latest_result(&self, stage_name: &str) -> Option<&serde_json::Value> {
        self.stack.latest_result(stage_name)
    }

    /// Most recent STAGE_COMPLETED payload of every stage.
    #[must_use]
    pub fn get_all_latest_results(&self) -> HashMap<String, serde_json::Value> {
        self.stack.all_latest_results()
    }

    /// Seeds PENDING statuses for stages not tracked yet.
    pub fn register_stages<I, S>(&mut self, stage_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for name in stage_names {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                self.stage_statuses.entry(name.into())
            {
                slot.insert(StageStatus::Pending);
                changed = true;
            }
        }
        if changed {
            self.persist();
        }
    }

    /// Sets the status of `stage_name` and writes a checkpoint.
    pub fn set_stage_status(&mut self, stage_name: &str, status: StageStatus) {
        let previous = self.stage_statuses.insert(stage_name.to_string(), status);
        if previous != Some(status) {
            debug!(run_id = %self.run_id, stage = %stage_name, status = %status, "Stage status");
            self.persist();
        }
    }

    /// Status of `stage_name`.
    #[must_use]
    pub fn stage_status(&self, stage_name: &str) -> Option<StageStatus> {
        self.stage_statuses.get(stage_name).copied()
    }

    /// All tracked stage statuses, sorted by stage name.
    #[must_use]
    pub const fn stage_statuses(&self) -> &BTreeMap<String, StageStatus> {
        &self.stage_statuses
    }

    /// Records a successful attempt of `stage_name`.
    pub fn record_success(&mut self, stage_name: &str, duration: Duration) -> &StageHealth {
        let health = self.health.entry(stage_name.to_string()).or_default();
        health.record_success(duration);
        health
    }

    /// Records a failed attempt of `stage_name`.
    pub fn record_failure(
        &mut self,
        stage_name: &str,
        duration: Duration,
        error: impl Into<String>,
    ) -> &StageHealth {
        let health = self.health.entry(stage_name.to_string()).or_default();
        health.record_failure(duration, error);
        health
    }

    /// Health of `stage_name`, `None` before its first attempt.
    #[must_use]
    pub fn stage_health(&self, stage_name: &str) -> Option<&StageHealth> {
        self.health.get(stage_name)
    }

    /// Health of every stage that ran.
    #[must_use]
    pub const fn all_health(&self) -> &HashMap<String, StageHealth> {
        &self.health
    }

    /// Derives the checkpoint for the current state.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            run_id: self.run_id.clone(),
            version: CHECKPOINT_VERSION,
            sequence: self.sequence,
            stage_statuses: self.stage_statuses.clone(),
            fsm_state: self.state,
            updated_at: Utc::now(),
            latest_results: self.stack.all_latest_results().into_iter().collect(),
            stage_health: self
                .health
                .iter()
                .map(|(name, health)| (name.clone(), health.clone()))
                .collect(),
        }
    }

    /// Current persistence status.
    #[must_use]
    pub const fn persistence_status(&self) -> &PersistenceStatus {
        &self.persistence
    }

    /// Writes a checkpoint now.
    ///
    /// Does nothing without a store or while degraded. A failed write
    /// degrades the machine and is returned.
    pub fn save_checkpoint(&mut self) -> Result<(), CheckpointIoError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        if self.persistence.is_degraded() {
            return Ok(());
        }
        self.sequence += 1;
        let checkpoint = self.checkpoint();
        match store.save(&self.run_id, &checkpoint) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.degrade(&err);
                Err(err)
            }
        }
    }

    /// Re-enables writes and flushes the current checkpoint.
    ///
    /// If the flush fails the machine stays degraded.
    pub fn restore_persistence(&mut self) -> Result<(), CheckpointIoError> {
        if self.persistence.is_degraded() {
            info!(run_id = %self.run_id, "Re-enabling checkpoint writes");
        }
        self.persistence = PersistenceStatus::Healthy;
        self.save_checkpoint()
    }

    /// Archives the run's checkpoint.
    pub fn archive_checkpoint(&self) -> Result<(), CheckpointIoError> {
        match self.store {
            Some(ref store) if !self.persistence.is_degraded() => store.archive(&self.run_id),
            _ => Ok(()),
        }
    }

    fn persist(&mut self) {
        // Failures are already recorded by `degrade`.
        let _ = self.save_checkpoint();
    }

    fn degrade(&mut self, err: &CheckpointIoError) {
        error!(
            run_id = %self.run_id,
            error = %err,
            "Checkpoint write failed, continuing in memory only"
        );
        self.persistence = PersistenceStatus::Degraded {
            error: err.to_string(),
            since: Utc::now(),
        };
        self.events.publish(PipelineEvent::PersistenceDegraded {
            run_id: self.run_id.clone(),
            error: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{InMemoryCheckpointStore, MockCheckpointStore};
    use crate::core::{StageFailure, StageOutput};
    use pretty_assertions::assert_eq;
    use PipelineState::*;

    fn no_meta() -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    fn completed(stage: &str, value: i64) -> StateStackEntry {
        StateStackEntry::stage_completed(
            stage,
            &StageOutput::ok_value("v", serde_json::json!(value)),
            Duration::from_millis(3),
            0,
        )
    }

    #[test]
    fn test_illegal_transitions_leave_state_unchanged() {
        let table = TransitionTable::default();
        for from in PipelineState::ALL {
            for to in PipelineState::ALL {
                if table.allows(from, to) {
                    continue;
                }
                let mut machine = StateMachine::new("run");
                machine.state = from;
                let err = machine.transition(to, "probe", "", no_meta()).unwrap_err();
                assert_eq!(err.from, from);
                assert_eq!(err.to, to);
                assert_eq!(machine.current_state(), from);
                assert!(machine.history().is_empty());
            }
        }
    }

    #[test]
    fn test_transition_records_audit_and_checkpoints() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut machine = StateMachine::new("run-1").with_store(store.clone());

        let mut metadata = no_meta();
        metadata.insert("card".to_string(), serde_json::json!("T-1"));
        let record = machine
            .transition(Analyzing, "start", "new card", metadata)
            .unwrap();
        assert_eq!(record.from, Idle);
        assert_eq!(record.metadata["card"], serde_json::json!("T-1"));
        assert_eq!(machine.history().len(), 1);

        let saved = store.load("run-1").unwrap().unwrap();
        assert_eq!(saved.fsm_state, Analyzing);
        assert_eq!(saved.sequence, 1);
    }

    #[test]
    fn test_push_pop_and_queries() {
        let mut machine = StateMachine::new("run");
        assert_eq!(machine.push_entry(completed("plan", 1)), 1);
        machine.push_entry(StateStackEntry::stage_failed(
            "build",
            &StageFailure::new("compile", "oops"),
            0,
        ));
        machine.push_entry(completed("plan", 2));

        let plan = StageOutput::from_payload(machine.get_latest_result("plan").unwrap());
        assert_eq!(plan.get("v"), Some(&serde_json::json!(2)));
        assert!(machine.get_latest_result("build").is_none());

        let popped = machine.pop_state().unwrap();
        assert_eq!(popped.stage_name(), Some("plan"));
        let plan = StageOutput::from_payload(machine.get_latest_result("plan").unwrap());
        assert_eq!(plan.get("v"), Some(&serde_json::json!(1)));

        machine.pop_state();
        machine.pop_state();
        assert!(machine.pop_state().is_none());
    }

    #[test]
    fn test_push_state_generic_context() {
        let mut machine = StateMachine::new("run");
        let mut context = no_meta();
        context.insert("note".to_string(), serde_json::json!("manual"));
        machine.push_state(Recovering, context);
        assert_eq!(machine.stack().peek().unwrap().state, Recovering);
        assert!(machine.get_all_latest_results().is_empty());
    }

    #[test]
    fn test_register_and_set_statuses() {
        let mut machine = StateMachine::new("run");
        machine.register_stages(["plan", "build"]);
        machine.set_stage_status("plan", StageStatus::Completed);
        machine.register_stages(["plan", "review"]);

        assert_eq!(machine.stage_status("plan"), Some(StageStatus::Completed));
        assert_eq!(machine.stage_status("review"), Some(StageStatus::Pending));
        assert_eq!(machine.stage_statuses().len(), 3);
    }

    #[test]
    fn test_health_tracking() {
        let mut machine = StateMachine::new("run");
        machine.record_failure("review", Duration::from_millis(5), "timeout");
        machine.record_failure("review", Duration::from_millis(5), "timeout");
        let health = machine.record_success("review", Duration::from_millis(5)).clone();

        assert_eq!(
            (health.execution_count, health.success_count, health.failure_count),
            (3, 1, 2)
        );
        assert!(machine.stage_health("plan").is_none());
    }

    #[test]
    fn test_checkpoint_round_trip_restores_machine() {
        let mut machine = StateMachine::new("run-3");
        machine.register_stages(["plan", "build", "review"]);
        machine.transition(Planning, "plan", "", no_meta()).unwrap();
        machine.transition(StageRunning, "run", "", no_meta()).unwrap();
        machine.push_entry(completed("plan", 7));
        machine.set_stage_status("plan", StageStatus::Completed);
        machine.transition(StageCompleted, "done", "", no_meta()).unwrap();
        machine.record_success("plan", Duration::from_millis(9));

        let json = machine.checkpoint().to_json().unwrap();
        let restored = StateMachine::from_checkpoint(Checkpoint::from_json(&json).unwrap());

        assert_eq!(restored.current_state(), StageCompleted);
        assert_eq!(restored.stage_statuses(), machine.stage_statuses());
        assert_eq!(restored.get_all_latest_results(), machine.get_all_latest_results());
        assert!(restored.stack().peek().unwrap().is_restored());
        assert_eq!(restored.stage_health("plan").unwrap().success_count, 1);
    }

    #[test]
    fn test_failed_write_degrades_and_keeps_memory_state() {
        let mut store = MockCheckpointStore::new();
        store.expect_save().times(1).returning(|run_id, _| {
            Err(CheckpointIoError::new(run_id, "save", "disk full"))
        });
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut machine = StateMachine::new("run-4")
            .with_store(Arc::new(store))
            .with_event_bus(events);

        machine.transition(Analyzing, "start", "", no_meta()).unwrap();
        machine.transition(Planning, "plan", "", no_meta()).unwrap();
        machine.push_entry(completed("analyze", 1));

        assert!(machine.persistence_status().is_degraded());
        assert_eq!(machine.current_state(), Planning);
        assert!(machine.get_latest_result("analyze").is_some());

        let mut saw_degraded = false;
        while let Ok(event) = rx.try_recv() {
            saw_degraded |= event.event_type() == "checkpoint.degraded";
        }
        assert!(saw_degraded);
    }

    #[test]
    fn test_restore_persistence_flushes() {
        let mut store = MockCheckpointStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_save()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|run_id, _| Err(CheckpointIoError::new(run_id, "save", "disk full")));
        store
            .expect_save()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, checkpoint| checkpoint.fsm_state == PipelineState::Planning)
            .returning(|_, _| Ok(()));

        let mut machine = StateMachine::new("run-5").with_store(Arc::new(store));
        machine.transition(Planning, "plan", "", no_meta()).unwrap();
        assert!(machine.persistence_status().is_degraded());

        machine.restore_persistence().unwrap();
        assert_eq!(machine.persistence_status(), &PersistenceStatus::Healthy);
    }

    #[test]
    fn test_events_published() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut machine = StateMachine::new("run-6").with_event_bus(events);

        machine.transition(Analyzing, "start", "", no_meta()).unwrap();
        machine.push_entry(completed("analyze", 1));
        machine.pop_state();

        let types: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event_type())
            .collect();
        assert_eq!(types, vec!["state.transitioned", "stack.pushed", "stack.popped"]);
    }
}
