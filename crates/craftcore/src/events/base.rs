use crate::blueprint::EdgeDef;
use crate::context::ContextOp;
use crate::error::ErrorRecord;
use crate::node::NodeResult;
use crate::state::WorkflowStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Structured execution events. When persisted, the stream is sufficient to
/// replay final state. Unknown variants must be ignored by consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum FlowcraftEvent {
    #[serde(rename = "workflow:start")]
    WorkflowStart {
        blueprint_id: String,
        execution_id: String,
    },
    #[serde(rename = "workflow:resume")]
    WorkflowResume {
        blueprint_id: String,
        execution_id: String,
    },
    #[serde(rename = "workflow:stall")]
    WorkflowStall {
        blueprint_id: String,
        execution_id: String,
        remaining_nodes: Vec<String>,
    },
    #[serde(rename = "workflow:pause")]
    WorkflowPause {
        blueprint_id: String,
        execution_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        awaiting_node_ids: Vec<String>,
    },
    #[serde(rename = "workflow:finish")]
    WorkflowFinish {
        blueprint_id: String,
        execution_id: String,
        status: WorkflowStatus,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<ErrorRecord>,
    },
    #[serde(rename = "node:start")]
    NodeStart {
        blueprint_id: String,
        execution_id: String,
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    #[serde(rename = "node:finish")]
    NodeFinish {
        blueprint_id: String,
        execution_id: String,
        node_id: String,
        result: NodeResult,
    },
    #[serde(rename = "node:error")]
    NodeError {
        blueprint_id: String,
        execution_id: String,
        node_id: String,
        error: ErrorRecord,
    },
    #[serde(rename = "node:retry")]
    NodeRetry {
        blueprint_id: String,
        execution_id: String,
        node_id: String,
        attempt: u32,
    },
    #[serde(rename = "node:fallback")]
    NodeFallback {
        blueprint_id: String,
        execution_id: String,
        node_id: String,
        fallback: String,
    },
    #[serde(rename = "node:skipped")]
    NodeSkipped {
        blueprint_id: String,
        execution_id: String,
        node_id: String,
        edge: EdgeDef,
    },
    #[serde(rename = "edge:evaluate")]
    EdgeEvaluate {
        blueprint_id: String,
        execution_id: String,
        source: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
        result: bool,
    },
    #[serde(rename = "context:change")]
    ContextChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_node: Option<String>,
        key: String,
        op: ContextOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    #[serde(rename = "job:enqueued")]
    JobEnqueued {
        execution_id: String,
        node_id: String,
    },
    #[serde(rename = "job:processed")]
    JobProcessed {
        execution_id: String,
        node_id: String,
    },
    #[serde(rename = "job:failed")]
    JobFailed {
        execution_id: String,
        node_id: String,
        error: ErrorRecord,
    },
    #[serde(rename = "batch:start")]
    BatchStart {
        execution_id: String,
        batch_id: String,
        scatter_node_id: String,
        worker_node_ids: Vec<String>,
    },
    #[serde(rename = "batch:finish")]
    BatchFinish {
        execution_id: String,
        batch_id: String,
        gather_node_id: String,
        results: Value,
    },
}

impl FlowcraftEvent {
    /// Execution id carried in the payload, when present.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            FlowcraftEvent::WorkflowStart { execution_id, .. }
            | FlowcraftEvent::WorkflowResume { execution_id, .. }
            | FlowcraftEvent::WorkflowStall { execution_id, .. }
            | FlowcraftEvent::WorkflowPause { execution_id, .. }
            | FlowcraftEvent::WorkflowFinish { execution_id, .. }
            | FlowcraftEvent::NodeStart { execution_id, .. }
            | FlowcraftEvent::NodeFinish { execution_id, .. }
            | FlowcraftEvent::NodeError { execution_id, .. }
            | FlowcraftEvent::NodeRetry { execution_id, .. }
            | FlowcraftEvent::NodeFallback { execution_id, .. }
            | FlowcraftEvent::NodeSkipped { execution_id, .. }
            | FlowcraftEvent::EdgeEvaluate { execution_id, .. }
            | FlowcraftEvent::JobEnqueued { execution_id, .. }
            | FlowcraftEvent::JobProcessed { execution_id, .. }
            | FlowcraftEvent::JobFailed { execution_id, .. }
            | FlowcraftEvent::BatchStart { execution_id, .. }
            | FlowcraftEvent::BatchFinish { execution_id, .. } => Some(execution_id),
            FlowcraftEvent::ContextChange { execution_id, .. } => execution_id.as_deref(),
        }
    }
}

/// Receives structured execution events. Implementations must tolerate
/// concurrent emission and may queue internally.
pub trait EventBus: Send + Sync {
    fn emit(&self, event: FlowcraftEvent);
}

/// Default bus backed by a tokio broadcast channel.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<FlowcraftEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowcraftEvent> {
        self.sender.subscribe()
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: FlowcraftEvent) {
        // Send fails only when no subscriber is attached; events are
        // fire-and-forget from the engine's perspective.
        let _ = self.sender.send(event);
    }
}

/// Records every event in memory. Used by tests and as the replay source.
#[derive(Default)]
pub struct CollectingEventBus {
    events: Mutex<Vec<FlowcraftEvent>>,
}

impl CollectingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<FlowcraftEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    pub fn take(&self) -> Vec<FlowcraftEvent> {
        std::mem::take(&mut *self.events.lock().expect("event log poisoned"))
    }
}

impl EventBus for CollectingEventBus {
    fn emit(&self, event: FlowcraftEvent) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}

/// Discards everything.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _event: FlowcraftEvent) {}
}

/// Fans an event out to several buses.
pub struct TeeEventBus {
    buses: Vec<Arc<dyn EventBus>>,
}

impl TeeEventBus {
    pub fn new(buses: Vec<Arc<dyn EventBus>>) -> Self {
        Self { buses }
    }
}

impl EventBus for TeeEventBus {
    fn emit(&self, event: FlowcraftEvent) {
        for bus in &self.buses {
            bus.emit(event.clone());
        }
    }
}
