// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Observability event bus.
//!
//! The executor and engine publish [`WorkflowEvent`]s for UI and logging
//! consumers. The bus is independent of the durable log: bus-only events
//! (`step_started`, `step_retrying`, `batch_completed`) never reach disk,
//! and a slow subscriber can lag without affecting execution.

use sdlc_orchestrator_state::WorkflowEvent;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast channel for workflow events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Lack of subscribers is not an error.
    pub fn publish(&self, event: WorkflowEvent) {
        debug!(event_type = event.event_type(), "bus event");
        let _ = self.tx.send(event);
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
    use chrono::Utc;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(WorkflowEvent::WorkflowCancelled { at: Utc::now() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "workflow_cancelled");
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(WorkflowEvent::WorkflowCancelled { at: Utc::now() });
    }
}
