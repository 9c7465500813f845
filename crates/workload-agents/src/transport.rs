//! Outbound chat transport seam.

use async_trait::async_trait;
use coordination::events::{SharedEventBus, WorkloadEvent};
use tracing::{debug, warn};

use crate::error::WorkloadResult;

/// Delivers workload events to humans (chat rooms, UI, logs).
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn publish(&self, event: WorkloadEvent) -> WorkloadResult<()>;
}

/// Transport backed by the in-process broadcast bus.
pub struct BusTransport {
    bus: SharedEventBus,
}

impl BusTransport {
    pub fn new(bus: SharedEventBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }
}

#[async_trait]
impl ChatTransport for BusTransport {
    async fn publish(&self, event: WorkloadEvent) -> WorkloadResult<()> {
        let event_type = event.event_type();
        if self.bus.publish(event) == 0 {
            debug!(event_type, "No bus subscribers for workload event");
        }
        Ok(())
    }
}

/// Publish, logging instead of failing. Delivery never blocks workload progress.
pub async fn notify(transport: &dyn ChatTransport, event: WorkloadEvent) {
    let event_type = event.event_type();
    if let Err(e) = transport.publish(event).await {
        warn!(event_type, "Failed to publish workload event: {e}");
    }
}
