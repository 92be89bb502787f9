//! Lifecycle events published by the engine as rows move through their flows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{FlowEvent, FlowEventKind, FlowStatus};

/// Receives every event the engine publishes. Called inline on the
/// engine's task, so implementations hand off rather than block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlowEvent);
}

/// Drops every event. The engine starts with this until a sink is attached.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FlowEvent) {}
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Keeps events in memory, in emission order.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FlowEvent>>,
}

impl CaptureSink {
    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.lock().clone()
    }

    pub fn count_kind(&self, kind: FlowEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FlowEvent) {
        self.events.lock().push(event);
    }
}

impl FlowEvent {
    /// Event about `status`, stamped with the emitting node. `sequence` is
    /// the message the event concerns, when there is one.
    pub fn for_status(
        kind: FlowEventKind,
        status: &FlowStatus,
        sequence: Option<u32>,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            status_id: status.id,
            flow_id: status.flow_id.clone(),
            phone: status.subscriber.phone.clone(),
            sequence,
            node_id: node_id.to_string(),
            timestamp: at,
        }
    }
}
