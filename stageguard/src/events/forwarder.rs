//! Background task bridging the event bus into a sink.

use super::{EventSink, PipelineEvent};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Spawns a task that emits every received event into `sink`.
///
/// The task ends when every sender of the bus has been dropped. A
/// subscriber that falls behind skips the events it missed and logs how
/// many were lost.
pub fn spawn_event_forwarder(
    mut rx: broadcast::Receiver<PipelineEvent>,
    sink: Arc<dyn EventSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => sink.emit(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event forwarder lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingEventSink, EventBus};

    #[tokio::test]
    async fn test_forwarder_drains_until_closed() {
        let bus = EventBus::new(16);
        let sink = Arc::new(CollectingEventSink::new());
        let handle = spawn_event_forwarder(bus.subscribe(), sink.clone());

        for attempt in 1..=3 {
            bus.publish(PipelineEvent::RetryScheduled {
                run_id: "run".to_string(),
                stage_name: "build".to_string(),
                attempt,
                delay_ms: 10,
            });
        }
        drop(bus);
        handle.await.unwrap();

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.retry_scheduled").len(), 3);
    }
}
