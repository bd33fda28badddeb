use crate::blueprint::NodeDef;
use crate::context::AsyncContextView;
use crate::error::WorkflowError;
use crate::state::WorkflowState;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Value returned by each node execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic_nodes: Vec<DynamicNode>,
    #[serde(
        default,
        rename = "_fallbackExecuted",
        skip_serializing_if = "is_false"
    )]
    pub fallback_executed: bool,
}

impl NodeResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn spawn(mut self, node: DynamicNode) -> Self {
        self.dynamic_nodes.push(node);
        self
    }
}

/// A node spliced into the running graph by another node's result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicNode {
    pub def: NodeDef,
    /// Gather node that must wait for this node under an `all` join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gather: Option<String>,
}

/// Per-call context handed to a node implementation.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub blueprint_id: String,
    pub execution_id: String,
    /// Async view of the run's context, scoped to this node for change events.
    pub context: AsyncContextView,
    pub input: Option<Value>,
    pub params: Value,
    pub dependencies: Arc<Dependencies>,
    pub state: Arc<RwLock<WorkflowState>>,
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn require_param(&self, key: &str) -> Result<&Value, WorkflowError> {
        self.param(key).ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "node '{}' requires param '{}'",
                self.node_id, key
            ))
        })
    }
}

/// Function-style node implementation.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn call(&self, ctx: NodeContext) -> Result<NodeResult, WorkflowError>;
}

/// Adapter turning an async closure into a [`NodeHandler`].
pub struct FnNode<F>(F)
where
    F: Fn(NodeContext) -> BoxFuture<'static, Result<NodeResult, WorkflowError>> + Send + Sync;

#[async_trait]
impl<F> NodeHandler for FnNode<F>
where
    F: Fn(NodeContext) -> BoxFuture<'static, Result<NodeResult, WorkflowError>> + Send + Sync,
{
    async fn call(&self, ctx: NodeContext) -> Result<NodeResult, WorkflowError> {
        (self.0)(ctx).await
    }
}

/// Wraps `f` into a registrable handler without manual boxing at call sites.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<NodeResult, WorkflowError>> + Send + 'static,
{
    Arc::new(FnNode(move |ctx| {
        let fut = f(ctx);
        Box::pin(fut) as BoxFuture<'static, _>
    }))
}

/// Lifecycle-style node: prep, exec (retried), post, with fallback and
/// recover phases. Only `exec` is subject to the retry policy.
#[async_trait]
pub trait LifecycleNode: Send + Sync {
    async fn prep(&mut self, _ctx: &NodeContext) -> Result<Value, WorkflowError> {
        Ok(Value::Null)
    }

    async fn exec(&mut self, prep: Value, ctx: &NodeContext) -> Result<Value, WorkflowError>;

    async fn post(&mut self, exec: Value, _ctx: &NodeContext) -> Result<NodeResult, WorkflowError> {
        Ok(NodeResult::with_output(exec))
    }

    /// Invoked when every `exec` attempt has failed. Returning `Ok` resumes
    /// the pipeline at `post` with the produced value.
    async fn fallback(
        &mut self,
        error: WorkflowError,
        _ctx: &NodeContext,
    ) -> Result<Value, WorkflowError> {
        Err(error)
    }

    /// Terminal hook invoked whenever any phase errored. Errors raised here
    /// are logged and never rethrown.
    async fn recover(
        &mut self,
        _error: &WorkflowError,
        _ctx: &NodeContext,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// Creates a fresh lifecycle instance per node execution.
pub trait LifecycleFactory: Send + Sync {
    fn instantiate(&self, params: &Value, node_id: &str) -> Box<dyn LifecycleNode>;
}

/// User-provided services exposed to nodes through the node context.
#[derive(Default)]
pub struct Dependencies {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, value: T) {
        self.entries.insert(name.into(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .get(name)
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_result_serde_uses_wire_field_names() {
        let result = NodeResult {
            output: Some(json!({"v": 1})),
            action: Some("high".into()),
            error: None,
            dynamic_nodes: vec![],
            fallback_executed: true,
        };
        let raw = serde_json::to_value(&result).unwrap();
        assert_eq!(raw["_fallbackExecuted"], json!(true));
        assert_eq!(raw["action"], json!("high"));
        assert!(raw.get("error").is_none());

        let parsed: NodeResult = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn dependencies_downcast_by_type() {
        let mut deps = Dependencies::new();
        deps.insert("limit", 42u32);
        deps.insert("name", "svc".to_string());
        assert_eq!(*deps.get::<u32>("limit").unwrap(), 42);
        assert_eq!(*deps.get::<String>("name").unwrap(), "svc");
        assert!(deps.get::<u32>("name").is_none());
        assert!(deps.get::<u32>("missing").is_none());
    }
}
