use crate::builtins;
use crate::execution::ExecutionContext;
use crate::middleware;
use crate::registry::NodeImpl;
use crate::strategy;
use craftcore::{
    input_key, output_key, ErrorRecord, FlowcraftEvent, InputSpec, NodeConfig, NodeContext,
    NodeDef, NodeResult, WorkflowError,
};
use serde_json::Value;

/// Outcome of a single node execution, as seen by the orchestrator.
pub enum NodeOutcome {
    Success(NodeResult),
    /// The node suspended itself; the awaiting set is already updated.
    Awaiting,
    /// A non-fatal failure on a node with `config.fallback`.
    FailedWithFallback {
        error: WorkflowError,
        fallback: String,
    },
    Failed(WorkflowError),
}

/// Per-node pipeline: input resolution, node context construction, events,
/// middleware, strategy dispatch, and fallback routing.
pub struct NodeExecutor {
    ecx: ExecutionContext,
    def: NodeDef,
}

impl NodeExecutor {
    pub fn new(ecx: ExecutionContext, def: NodeDef) -> Self {
        Self { ecx, def }
    }

    pub fn execute(&self) -> futures::future::BoxFuture<'_, NodeOutcome> {
        Box::pin(self.execute_inner())
    }

    async fn execute_inner(&self) -> NodeOutcome {
        let input = resolve_input(&self.ecx, &self.def).await;
        let nctx = self.node_context(input.clone()).await;
        let config = self.def.config.clone().unwrap_or_default();

        self.ecx.emit(FlowcraftEvent::NodeStart {
            blueprint_id: self.ecx.blueprint_id().to_string(),
            execution_id: self.ecx.execution_id.clone(),
            node_id: self.def.id.clone(),
            input,
        });

        let core = {
            let ecx = self.ecx.clone();
            let def = self.def.clone();
            let config = config.clone();
            let nctx = nctx.clone();
            move || -> futures::future::BoxFuture<'static, Result<NodeResult, WorkflowError>> {
                Box::pin(async move { core_execute(ecx, def, config, nctx).await })
            }
        };
        let outcome = middleware::run_chain(&self.ecx.services.middleware, &nctx, core).await;

        match outcome {
            Ok(result) => {
                let suspended = {
                    let state = self.ecx.state.read().await;
                    state.awaiting_info(&self.def.id).is_some()
                };
                if suspended {
                    tracing::debug!(node_id = %self.def.id, "node suspended");
                    return NodeOutcome::Awaiting;
                }
                self.ecx.emit(FlowcraftEvent::NodeFinish {
                    blueprint_id: self.ecx.blueprint_id().to_string(),
                    execution_id: self.ecx.execution_id.clone(),
                    node_id: self.def.id.clone(),
                    result: result.clone(),
                });
                NodeOutcome::Success(result)
            }
            Err(error) if error.is_cancelled() => NodeOutcome::Failed(error),
            Err(error) => {
                if !error.is_fatal() {
                    if let Some(fallback) = config.fallback.clone() {
                        self.ecx.emit(FlowcraftEvent::NodeFallback {
                            blueprint_id: self.ecx.blueprint_id().to_string(),
                            execution_id: self.ecx.execution_id.clone(),
                            node_id: self.def.id.clone(),
                            fallback: fallback.clone(),
                        });
                        return NodeOutcome::FailedWithFallback { error, fallback };
                    }
                }
                tracing::error!(node_id = %self.def.id, error = %error, "node failed");
                self.ecx.emit(FlowcraftEvent::NodeError {
                    blueprint_id: self.ecx.blueprint_id().to_string(),
                    execution_id: self.ecx.execution_id.clone(),
                    node_id: self.def.id.clone(),
                    error: ErrorRecord::from_error(&error)
                        .with_node(self.def.id.clone())
                        .with_blueprint(self.ecx.blueprint_id())
                        .with_execution(self.ecx.execution_id.clone()),
                });
                NodeOutcome::Failed(error)
            }
        }
    }

    async fn node_context(&self, input: Option<Value>) -> NodeContext {
        let context = {
            let state = self.ecx.state.read().await;
            state.scoped_view(&self.def.id)
        };
        NodeContext {
            node_id: self.def.id.clone(),
            blueprint_id: self.ecx.blueprint_id().to_string(),
            execution_id: self.ecx.execution_id.clone(),
            context,
            input,
            params: self.def.params.clone().unwrap_or(Value::Null),
            dependencies: self.ecx.services.dependencies.clone(),
            state: self.ecx.state.clone(),
            cancellation: self.ecx.cancellation.clone(),
        }
    }
}

async fn core_execute(
    ecx: ExecutionContext,
    def: NodeDef,
    config: NodeConfig,
    nctx: NodeContext,
) -> Result<NodeResult, WorkflowError> {
    match ecx.registry.resolve(&def.uses) {
        None => Err(WorkflowError::Configuration(format!(
            "no implementation registered for '{}'",
            def.uses
        ))),
        Some(NodeImpl::Function(handler)) => {
            strategy::run_function_strategy(&handler, &nctx, &config, &ecx.services.event_bus)
                .await
        }
        Some(NodeImpl::Lifecycle(factory)) => {
            strategy::run_lifecycle_strategy(&factory, &nctx, &config, &ecx.services.event_bus)
                .await
        }
        Some(NodeImpl::Builtin(builtin)) => builtins::run(builtin, &ecx, &def, &nctx).await,
    }
}

/// Resolves the node's input per its `inputs` declaration: bare keys prefer
/// the outputs namespace, underscore-prefixed keys resolve directly, and an
/// undeclared input falls back to the staged `_inputs.<id>` slot.
pub async fn resolve_input(ecx: &ExecutionContext, def: &NodeDef) -> Option<Value> {
    let view = {
        let state = ecx.state.read().await;
        state.view()
    };
    match &def.inputs {
        Some(InputSpec::Key(key)) => resolve_key(&view, key).await,
        Some(InputSpec::Map(map)) => {
            let mut object = serde_json::Map::new();
            for (param, key) in map {
                if let Some(value) = resolve_key(&view, key).await {
                    object.insert(param.clone(), value);
                }
            }
            Some(Value::Object(object))
        }
        None => view.get(&input_key(&def.id)).await,
    }
}

async fn resolve_key(view: &craftcore::AsyncContextView, key: &str) -> Option<Value> {
    if !key.starts_with('_') {
        if let Some(value) = view.get(&output_key(key)).await {
            return Some(value);
        }
    }
    view.get(key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Services;
    use crate::registry::NodeRegistry;
    use craftcore::{handler_fn, Blueprint, Context, Dependencies, JsonSerializer, NullEventBus};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    fn services() -> Arc<Services> {
        Arc::new(Services {
            event_bus: Arc::new(NullEventBus),
            evaluator: Arc::new(crate::evaluator::PathEvaluator),
            serializer: Arc::new(JsonSerializer),
            middleware: Vec::new(),
            dependencies: Arc::new(Dependencies::new()),
        })
    }

    fn ecx_with_context(context: Context) -> ExecutionContext {
        let mut registry = NodeRegistry::new();
        registry.register_function("task", handler_fn(|_ctx| async { Ok(NodeResult::empty()) }));
        ExecutionContext {
            execution_id: "exec".into(),
            blueprint: Arc::new(Blueprint::new("bp")),
            state: Arc::new(RwLock::new(craftcore::WorkflowState::new(context))),
            registry: Arc::new(registry),
            services: services(),
            blueprints: Arc::new(RwLock::new(HashMap::new())),
            cancellation: CancellationToken::new(),
            concurrency: 4,
            strict: false,
        }
    }

    #[tokio::test]
    async fn bare_key_prefers_outputs_namespace() {
        let mut context = Context::new();
        context.set("data", json!("direct"));
        context.set("_outputs.data", json!("from-output"));
        let ecx = ecx_with_context(context);
        let def = NodeDef::new("n", "task").with_inputs(InputSpec::Key("data".into()));
        assert_eq!(resolve_input(&ecx, &def).await, Some(json!("from-output")));
    }

    #[tokio::test]
    async fn underscore_key_resolves_directly() {
        let mut context = Context::new();
        context.set("_raw", json!(7));
        context.set("_outputs._raw", json!("never"));
        let ecx = ecx_with_context(context);
        let def = NodeDef::new("n", "task").with_inputs(InputSpec::Key("_raw".into()));
        assert_eq!(resolve_input(&ecx, &def).await, Some(json!(7)));
    }

    #[tokio::test]
    async fn mapping_builds_an_object_and_skips_missing_keys() {
        let mut context = Context::new();
        context.set("_outputs.a", json!(1));
        context.set("b", json!(2));
        let ecx = ecx_with_context(context);
        let mut map = std::collections::BTreeMap::new();
        map.insert("left".to_string(), "a".to_string());
        map.insert("right".to_string(), "b".to_string());
        map.insert("gone".to_string(), "missing".to_string());
        let def = NodeDef::new("n", "task").with_inputs(InputSpec::Map(map));
        assert_eq!(
            resolve_input(&ecx, &def).await,
            Some(json!({"left": 1, "right": 2}))
        );
    }

    #[tokio::test]
    async fn undeclared_inputs_fall_back_to_staged_slot() {
        let mut context = Context::new();
        context.set("_inputs.n", json!("staged"));
        let ecx = ecx_with_context(context);
        let def = NodeDef::new("n", "task");
        assert_eq!(resolve_input(&ecx, &def).await, Some(json!("staged")));
    }

    #[tokio::test]
    async fn missing_implementation_is_a_fatal_failure() {
        let ecx = ecx_with_context(Context::new());
        let executor = NodeExecutor::new(ecx, NodeDef::new("n", "ghost"));
        match executor.execute().await {
            NodeOutcome::Failed(error) => assert!(error.is_fatal()),
            _ => panic!("expected failure"),
        }
    }
}
