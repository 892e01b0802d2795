//! Typed pipeline events.
//!
//! Events go out over a tokio broadcast channel. Publishing never blocks and
//! never fails: with no subscribers the event is dropped, and a subscriber
//! that falls behind sees `RecvError::Lagged`.

use serde::{Deserialize, Serialize};
use tessera_core::Timestamp;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default buffer of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something observable that happened during a flow invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A record carried personal data.
    PiiDetected {
        flow_id: String,
        correlation_id: Uuid,
        fields: Vec<String>,
    },

    /// A stage failed. `required` failures abort the flow.
    StageFailed {
        flow_id: String,
        correlation_id: Uuid,
        stage: String,
        required: bool,
        reason: String,
    },

    /// A privacy budget refused a release.
    BudgetRejected {
        flow_id: String,
        correlation_id: Uuid,
        purpose: String,
        requested: f64,
    },

    FlowCompleted {
        flow_id: String,
        correlation_id: Uuid,
        warnings: usize,
        at: Timestamp,
    },

    FlowFailed {
        flow_id: String,
        correlation_id: Uuid,
        stage: String,
        reason: String,
        at: Timestamp,
    },
}

impl PipelineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::PiiDetected { .. } => "PiiDetected",
            PipelineEvent::StageFailed { .. } => "StageFailed",
            PipelineEvent::BudgetRejected { .. } => "BudgetRejected",
            PipelineEvent::FlowCompleted { .. } => "FlowCompleted",
            PipelineEvent::FlowFailed { .. } => "FlowFailed",
        }
    }

    pub fn flow_id(&self) -> &str {
        match self {
            PipelineEvent::PiiDetected { flow_id, .. }
            | PipelineEvent::StageFailed { flow_id, .. }
            | PipelineEvent::BudgetRejected { flow_id, .. }
            | PipelineEvent::FlowCompleted { flow_id, .. }
            | PipelineEvent::FlowFailed { flow_id, .. } => flow_id,
        }
    }
}

/// Broadcast bus for [`PipelineEvent`]s.
#[derive(Debug, Clone)]
pub struct PipelineEventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for PipelineEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl PipelineEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => {
                tracing::trace!(event_type, receivers, "Published pipeline event");
            }
            Err(_) => {
                tracing::trace!(event_type, "No subscribers for pipeline event");
            }
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
