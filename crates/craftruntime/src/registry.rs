use craftcore::{LifecycleFactory, NodeHandler};
use std::collections::HashMap;
use std::sync::Arc;

pub const WAIT_USES: &str = "wait";
pub const SLEEP_USES: &str = "sleep";
pub const SUBFLOW_USES: &str = "subflow";
pub const BATCH_SCATTER_USES: &str = "batch-scatter";
pub const BATCH_GATHER_USES: &str = "batch-gather";
pub const LOOP_CONTROLLER_USES: &str = "loop-controller";

/// Engine-provided node behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Wait,
    Sleep,
    Subflow,
    BatchScatter,
    BatchGather,
    LoopController,
}

impl Builtin {
    pub fn from_uses(uses: &str) -> Option<Builtin> {
        match uses {
            WAIT_USES => Some(Builtin::Wait),
            SLEEP_USES => Some(Builtin::Sleep),
            SUBFLOW_USES => Some(Builtin::Subflow),
            BATCH_SCATTER_USES => Some(Builtin::BatchScatter),
            BATCH_GATHER_USES => Some(Builtin::BatchGather),
            LOOP_CONTROLLER_USES => Some(Builtin::LoopController),
            _ => None,
        }
    }
}

/// A registered node implementation.
#[derive(Clone)]
pub enum NodeImpl {
    Function(Arc<dyn NodeHandler>),
    Lifecycle(Arc<dyn LifecycleFactory>),
    Builtin(Builtin),
}

/// Maps `uses` keys to implementations. Built-ins resolve implicitly unless
/// shadowed by an explicit registration.
#[derive(Default, Clone)]
pub struct NodeRegistry {
    entries: HashMap<String, NodeImpl>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&mut self, uses: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        let uses = uses.into();
        tracing::debug!(uses = %uses, "registering function node");
        self.entries.insert(uses, NodeImpl::Function(handler));
    }

    pub fn register_lifecycle(
        &mut self,
        uses: impl Into<String>,
        factory: Arc<dyn LifecycleFactory>,
    ) {
        let uses = uses.into();
        tracing::debug!(uses = %uses, "registering lifecycle node");
        self.entries.insert(uses, NodeImpl::Lifecycle(factory));
    }

    pub fn resolve(&self, uses: &str) -> Option<NodeImpl> {
        self.entries
            .get(uses)
            .cloned()
            .or_else(|| Builtin::from_uses(uses).map(NodeImpl::Builtin))
    }

    pub fn contains(&self, uses: &str) -> bool {
        self.entries.contains_key(uses) || Builtin::from_uses(uses).is_some()
    }

    pub fn registered_uses(&self) -> Vec<String> {
        let mut uses: Vec<String> = self.entries.keys().cloned().collect();
        uses.sort();
        uses
    }

    /// Merges a per-run registry over this one; overlay entries win.
    pub fn merged(&self, overlay: &NodeRegistry) -> NodeRegistry {
        let mut entries = self.entries.clone();
        entries.extend(
            overlay
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        NodeRegistry { entries }
    }
}
