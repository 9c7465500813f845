//! Event bus for workload coordination
//!
//! Pub/sub fan-out of [`WorkloadEvent`]s over a Tokio broadcast channel.
//! Publishing never blocks; slow subscribers observe `Lagged` and skip ahead.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::WorkloadEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast event bus
pub struct EventBus {
    sender: broadcast::Sender<WorkloadEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers, returning how many received it.
    /// Events published with no subscribers are dropped.
    pub fn publish(&self, event: WorkloadEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "Event published");
                count
            }
            Err(_) => {
                debug!(event_type, "Event published (no receivers)");
                0
            }
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkloadEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{WorkloadId, WorkloadStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn progress(id: WorkloadId) -> WorkloadEvent {
        WorkloadEvent::TurnProgress {
            workload_id: id,
            detail: "working".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let target = Uuid::new_v4();
        assert_eq!(bus.publish(progress(target)), 2);

        assert_eq!(first.recv().await.unwrap().event_type(), "turn_progress");
        assert_eq!(second.recv().await.unwrap().workload_id(), Some(target));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new().shared();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(progress(Uuid::new_v4())), 0);

        let mut late = bus.subscribe();
        bus.publish(WorkloadEvent::status_changed(
            Uuid::new_v4(),
            WorkloadStatus::Assigned,
            WorkloadStatus::Running,
            None,
        ));
        assert_eq!(late.recv().await.unwrap().event_type(), "status_changed");
    }
}
