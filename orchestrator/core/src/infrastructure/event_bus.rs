// Event Bus Implementation - Pub/Sub for Domain Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Enables real-time event streaming to external observability and
// analytics consumers.
//
// In-memory only: events are lost on restart. Durable event storage is an
// external collaborator.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::RunEvent;
use crate::domain::run::RunId;

/// Event bus for publishing and subscribing to run events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<RunEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RunEvent) {
        debug!(topic = event.topic(), run_id = %event.run_id(), "Publishing event");

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all run events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for a specific run
    pub fn subscribe_run(&self, run_id: RunId) -> RunEventReceiver {
        RunEventReceiver {
            receiver: self.sender.subscribe(),
            run_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all run events
pub struct EventReceiver {
    receiver: broadcast::Receiver<RunEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocks until an event is available)
    pub async fn recv(&mut self) -> Result<RunEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<RunEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to a single run's events
pub struct RunEventReceiver {
    receiver: broadcast::Receiver<RunEvent>,
    run_id: RunId,
}

impl RunEventReceiver {
    /// Receive the next event for the subscribed run, skipping others
    pub async fn recv(&mut self) -> Result<RunEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if event.run_id() == self.run_id {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::TenantId;
    use crate::domain::workflow::WorkflowId;
    use chrono::Utc;

    fn started(run_id: RunId) -> RunEvent {
        RunEvent::RunStarted {
            run_id,
            tenant_id: TenantId::new("t1"),
            workflow_id: WorkflowId::new(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let run_id = RunId::new();
        event_bus.publish(started(run_id));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.run_id(), run_id);
        assert_eq!(received.topic(), "workflow.run.started");
    }

    #[tokio::test]
    async fn test_run_event_filtering() {
        let event_bus = EventBus::new(10);
        let run_id = RunId::new();
        let other_run_id = RunId::new();

        let mut receiver = event_bus.subscribe_run(run_id);

        // Event for a different run should be filtered out
        event_bus.publish(started(other_run_id));
        event_bus.publish(started(run_id));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.run_id(), run_id);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish(started(RunId::new()));

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
    }
}
