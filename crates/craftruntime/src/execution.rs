use crate::evaluator::Evaluator;
use crate::middleware::Middleware;
use crate::registry::NodeRegistry;
use craftcore::{Blueprint, Dependencies, EventBus, FlowcraftEvent, Serializer, WorkflowState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Services shared by every component of a run.
pub struct Services {
    pub event_bus: Arc<dyn EventBus>,
    pub evaluator: Arc<dyn Evaluator>,
    pub serializer: Arc<dyn Serializer>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub dependencies: Arc<Dependencies>,
}

/// Per-run aggregate handed to the orchestrator and node executors.
/// Cheap to clone; all fields are shared handles.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    /// Sanitized static blueprint; the traverser owns the dynamic copy.
    pub blueprint: Arc<Blueprint>,
    pub state: Arc<RwLock<WorkflowState>>,
    pub registry: Arc<NodeRegistry>,
    pub services: Arc<Services>,
    /// Registered blueprints, consumed by the subflow built-in.
    pub blueprints: Arc<RwLock<HashMap<String, Blueprint>>>,
    pub cancellation: CancellationToken,
    pub concurrency: usize,
    pub strict: bool,
}

impl ExecutionContext {
    pub fn blueprint_id(&self) -> &str {
        &self.blueprint.id
    }

    pub fn emit(&self, event: FlowcraftEvent) {
        self.services.event_bus.emit(event);
    }
}

/// Default bound on nodes executing within one tick.
pub fn default_concurrency() -> usize {
    num_cpus::get().clamp(1, 10)
}
