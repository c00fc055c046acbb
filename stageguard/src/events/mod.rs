//! Event fan-out for observability.
//!
//! The state machine and the supervisor publish [`PipelineEvent`]s on an
//! [`EventBus`]. Listeners subscribe to the bus; the publishers never know
//! who is listening. [`spawn_event_forwarder`] bridges a subscription into
//! an [`EventSink`].

mod forwarder;
mod sink;

pub use forwarder::spawn_event_forwarder;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::breaker::CircuitState;
use crate::core::PipelineState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default number of events a slow subscriber may lag behind.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The primary state changed.
    Transitioned {
        /// Run id.
        run_id: String,
        /// Previous state.
        from: PipelineState,
        /// New state.
        to: PipelineState,
        /// Triggering event name.
        event: String,
        /// Free-form reason.
        reason: String,
        /// When the transition happened.
        at: DateTime<Utc>,
    },
    /// An entry was pushed onto the state stack.
    Pushed {
        /// Run id.
        run_id: String,
        /// State of the pushed entry.
        state: PipelineState,
        /// Stage the entry belongs to.
        stage_name: Option<String>,
        /// Stack depth after the push.
        depth: usize,
    },
    /// An entry was popped for rollback.
    Popped {
        /// Run id.
        run_id: String,
        /// State of the popped entry.
        state: PipelineState,
        /// Stage the entry belonged to.
        stage_name: Option<String>,
        /// Stack depth after the pop.
        depth: usize,
    },
    /// A circuit breaker changed state.
    CircuitChanged {
        /// Run id.
        run_id: String,
        /// Stage the breaker guards.
        stage_name: String,
        /// Previous breaker state.
        from: CircuitState,
        /// New breaker state.
        to: CircuitState,
    },
    /// A stage attempt failed and will be retried.
    RetryScheduled {
        /// Run id.
        run_id: String,
        /// Stage name.
        stage_name: String,
        /// The attempt that failed.
        attempt: u32,
        /// Delay before the next attempt, in milliseconds.
        delay_ms: u64,
    },
    /// A stage was handed to the escalation handler.
    Escalated {
        /// Run id.
        run_id: String,
        /// Stage name.
        stage_name: String,
        /// Attempts made before escalating.
        attempts: u32,
    },
    /// A checkpoint could not be written; the run continues in memory.
    PersistenceDegraded {
        /// Run id.
        run_id: String,
        /// Error message.
        error: String,
    },
}

impl PipelineEvent {
    /// Dotted event type used by sinks (`"state.transitioned"`, ...).
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Transitioned { .. } => "state.transitioned",
            Self::Pushed { .. } => "stack.pushed",
            Self::Popped { .. } => "stack.popped",
            Self::CircuitChanged { .. } => "circuit.changed",
            Self::RetryScheduled { .. } => "stage.retry_scheduled",
            Self::Escalated { .. } => "stage.escalated",
            Self::PersistenceDegraded { .. } => "checkpoint.degraded",
        }
    }

    /// Run the event belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::Transitioned { run_id, .. }
            | Self::Pushed { run_id, .. }
            | Self::Popped { run_id, .. }
            | Self::CircuitChanged { run_id, .. }
            | Self::RetryScheduled { run_id, .. }
            | Self::Escalated { run_id, .. }
            | Self::PersistenceDegraded { run_id, .. } => run_id,
        }
    }

    /// Serializes the event for a sink.
    #[must_use]
    pub fn to_data(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Broadcast channel carrying [`PipelineEvent`]s.
///
/// Cloning the bus clones the sender; all clones feed the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
