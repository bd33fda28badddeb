use crate::analysis::GraphAnalysis;
use crate::builtins::extract_subflow_output;
use crate::evaluator::{Evaluator, PathEvaluator};
use crate::execution::{default_concurrency, ExecutionContext, Services};
use crate::executor::{NodeExecutor, NodeOutcome};
use crate::middleware::Middleware;
use crate::orchestrator::{Orchestrator, StepOrchestrator};
use crate::registry::{NodeRegistry, SUBFLOW_USES};
use crate::scheduler::{ScheduledResume, TimerScheduler};
use crate::traverser::GraphTraverser;
use craftcore::{
    AwaitReason, Blueprint, BroadcastEventBus, Context, Dependencies, ErrorRecord, EventBus,
    FlowcraftEvent, JsonSerializer, NodeResult, Serializer, WorkflowError, WorkflowResult,
    WorkflowState, WorkflowStatus, EXECUTION_ID_KEY, SUBFLOW_STATE_PREFIX,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Construction-time configuration for the runtime.
pub struct RuntimeConfig {
    pub registry: NodeRegistry,
    pub blueprints: HashMap<String, Blueprint>,
    pub dependencies: Dependencies,
    pub event_bus: Option<Arc<dyn EventBus>>,
    pub evaluator: Option<Arc<dyn Evaluator>>,
    pub serializer: Option<Arc<dyn Serializer>>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub strict: bool,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            registry: NodeRegistry::new(),
            blueprints: HashMap::new(),
            dependencies: Dependencies::new(),
            event_bus: None,
            evaluator: None,
            serializer: None,
            middleware: Vec::new(),
            strict: false,
            event_buffer_size: 1024,
        }
    }
}

/// Per-run overrides.
#[derive(Default, Clone)]
pub struct RunOptions {
    /// Dynamic registry merged over the runtime's for this run only.
    pub registry: Option<NodeRegistry>,
    pub strict: Option<bool>,
    pub signal: Option<CancellationToken>,
    pub concurrency: Option<usize>,
}

/// Initial state for `run`: empty, a serialized context, or plain values.
#[derive(Clone)]
pub enum InitialState {
    Empty,
    Serialized(String),
    Values(Value),
}

impl Default for InitialState {
    fn default() -> Self {
        InitialState::Empty
    }
}

impl From<Value> for InitialState {
    fn from(value: Value) -> Self {
        InitialState::Values(value)
    }
}

impl From<&str> for InitialState {
    fn from(text: &str) -> Self {
        InitialState::Serialized(text.to_string())
    }
}

impl From<String> for InitialState {
    fn from(text: String) -> Self {
        InitialState::Serialized(text)
    }
}

/// Payload delivered to an awaiting node on resumption.
#[derive(Default, Clone)]
pub struct ResumeData {
    pub output: Option<Value>,
}

impl ResumeData {
    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
        }
    }
}

/// Result of a single-node execution.
pub struct NodeExecution {
    pub result: NodeResult,
    pub serialized_context: String,
}

/// Top-level façade: wires services, routes edges, and drives runs.
pub struct FlowcraftRuntime {
    registry: Arc<NodeRegistry>,
    services: Arc<Services>,
    blueprints: Arc<RwLock<HashMap<String, Blueprint>>>,
    scheduler: std::sync::RwLock<Option<Weak<TimerScheduler>>>,
    strict: bool,
}

impl FlowcraftRuntime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let event_bus = config
            .event_bus
            .unwrap_or_else(|| Arc::new(BroadcastEventBus::new(config.event_buffer_size)));
        let services = Services {
            event_bus,
            evaluator: config.evaluator.unwrap_or_else(|| Arc::new(PathEvaluator)),
            serializer: config.serializer.unwrap_or_else(|| Arc::new(JsonSerializer)),
            middleware: config.middleware,
            dependencies: Arc::new(config.dependencies),
        };
        Self {
            registry: Arc::new(config.registry),
            services: Arc::new(services),
            blueprints: Arc::new(RwLock::new(config.blueprints)),
            scheduler: std::sync::RwLock::new(None),
            strict: config.strict,
        }
    }

    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        self.services.event_bus.clone()
    }

    pub fn serializer(&self) -> Arc<dyn Serializer> {
        self.services.serializer.clone()
    }

    pub async fn register_blueprint(&self, blueprint: Blueprint) {
        let mut blueprints = self.blueprints.write().await;
        blueprints.insert(blueprint.id.clone(), blueprint);
    }

    pub async fn blueprint(&self, id: &str) -> Option<Blueprint> {
        self.blueprints.read().await.get(id).cloned()
    }

    /// Attaches an optional timer scheduler; awaiting timer nodes of later
    /// runs are registered with it automatically.
    pub fn attach_scheduler(&self, scheduler: &Arc<TimerScheduler>) {
        *self.scheduler.write().expect("scheduler slot poisoned") = Some(Arc::downgrade(scheduler));
    }

    fn scheduler(&self) -> Option<Arc<TimerScheduler>> {
        self.scheduler
            .read()
            .expect("scheduler slot poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Executes a blueprint to quiescence, awaiting, or cancellation.
    pub async fn run(
        &self,
        blueprint: &Blueprint,
        initial: InitialState,
        options: RunOptions,
    ) -> Result<WorkflowResult, WorkflowError> {
        let blueprint = blueprint.sanitized()?;
        blueprint.validate()?;
        let execution_id = Uuid::new_v4().to_string();
        let strict = options.strict.unwrap_or(self.strict);

        let mut context = self.initial_context(initial)?;
        context.bind_bus(self.services.event_bus.clone(), execution_id.clone());
        let state = WorkflowState::new(context);

        tracing::info!(blueprint_id = %blueprint.id, execution_id = %execution_id, "starting workflow");
        self.services.event_bus.emit(FlowcraftEvent::WorkflowStart {
            blueprint_id: blueprint.id.clone(),
            execution_id: execution_id.clone(),
        });
        self.services.event_bus.emit(FlowcraftEvent::WorkflowResume {
            blueprint_id: blueprint.id.clone(),
            execution_id: execution_id.clone(),
        });

        let analysis = GraphAnalysis::analyze(&blueprint);
        if strict && analysis.has_cycles() {
            return Err(WorkflowError::Cycle(analysis.cycles));
        }

        let ecx = self.execution_context(execution_id, blueprint.clone(), state, &options, strict);
        let traverser = GraphTraverser::new(blueprint, &analysis, strict, HashSet::new());
        let outcome = Orchestrator::new(ecx.clone(), traverser).run().await;
        self.finalize(ecx, outcome).await
    }

    /// Builds a tick-at-a-time orchestrator over the same pipeline.
    pub fn step_runner(
        &self,
        blueprint: &Blueprint,
        initial: InitialState,
        options: RunOptions,
    ) -> Result<StepOrchestrator, WorkflowError> {
        let blueprint = blueprint.sanitized()?;
        blueprint.validate()?;
        let execution_id = Uuid::new_v4().to_string();
        let strict = options.strict.unwrap_or(self.strict);
        let analysis = GraphAnalysis::analyze(&blueprint);
        if strict && analysis.has_cycles() {
            return Err(WorkflowError::Cycle(analysis.cycles));
        }
        let mut context = self.initial_context(initial)?;
        context.bind_bus(self.services.event_bus.clone(), execution_id.clone());
        let state = WorkflowState::new(context);
        let ecx = self.execution_context(execution_id, blueprint.clone(), state, &options, strict);
        let traverser = GraphTraverser::new(blueprint, &analysis, strict, HashSet::new());
        Ok(StepOrchestrator::new(ecx, traverser))
    }

    /// Resumes an awaiting workflow from its serialized context, completing
    /// the named (or first) awaiting node with `resume_data.output`.
    pub async fn resume(
        &self,
        blueprint: &Blueprint,
        serialized_context: &str,
        resume_data: ResumeData,
        node_id: Option<&str>,
        options: RunOptions,
    ) -> Result<WorkflowResult, WorkflowError> {
        let blueprint = blueprint.sanitized()?;
        blueprint.validate()?;
        let serializer = self.services.serializer.clone();
        let mut state = WorkflowState::from_serialized(serialized_context, serializer.as_ref())?;
        let execution_id = {
            let handle = state.context_handle();
            let stored = handle
                .read()
                .await
                .get(EXECUTION_ID_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            stored.unwrap_or_else(|| Uuid::new_v4().to_string())
        };
        state
            .bind_bus(self.services.event_bus.clone(), execution_id.clone())
            .await;

        let target = node_id
            .map(str::to_string)
            .or_else(|| state.first_awaiting().map(str::to_string));
        let Some(target) = target.filter(|t| state.awaiting_info(t).is_some()) else {
            // Resuming a node that is no longer awaiting must not
            // double-complete it; report the current state instead.
            let status = state.derive_status(true, blueprint.nodes.len());
            return state
                .build_result(status, serializer.as_ref(), &execution_id)
                .await;
        };

        tracing::info!(blueprint_id = %blueprint.id, execution_id = %execution_id, node_id = %target, "resuming workflow");
        self.services.event_bus.emit(FlowcraftEvent::WorkflowResume {
            blueprint_id: blueprint.id.clone(),
            execution_id: execution_id.clone(),
        });

        let node_def = blueprint.node(&target).cloned().ok_or_else(|| {
            WorkflowError::Configuration(format!("awaiting node '{target}' not in blueprint"))
        })?;

        let mut resume_output = resume_data.output.clone();
        if node_def.uses == SUBFLOW_USES {
            if let Some(output) = self
                .resume_subflow(&node_def, &state, &resume_data, &options)
                .await?
            {
                match output {
                    SubflowResumption::StillAwaiting => {
                        return state
                            .build_result(
                                WorkflowStatus::Awaiting,
                                serializer.as_ref(),
                                &execution_id,
                            )
                            .await;
                    }
                    SubflowResumption::Completed(value) => resume_output = Some(value),
                }
            }
        }

        state.record_completion(&target, resume_output.clone()).await;
        state.clear_awaiting(&target).await;

        let strict = options.strict.unwrap_or(self.strict);
        let analysis = GraphAnalysis::analyze(&blueprint);
        let completed = state.completed().clone();
        let ecx = self.execution_context(execution_id, blueprint.clone(), state, &options, strict);
        let traverser = GraphTraverser::new(blueprint, &analysis, strict, completed);
        let mut orchestrator = Orchestrator::new(ecx.clone(), traverser);
        let wired = NodeResult {
            output: resume_output,
            ..Default::default()
        };
        orchestrator.wire_successors(&target, &wired).await?;
        let outcome = orchestrator.run().await;
        self.finalize(ecx, outcome).await
    }

    /// Single-node execution for distributed adapters: same input
    /// resolution, strategies, middleware, and fallback handling, but the
    /// frontier is untouched.
    pub async fn execute_node(
        &self,
        blueprint: &Blueprint,
        node_id: &str,
        serialized_context: &str,
        options: RunOptions,
    ) -> Result<NodeExecution, WorkflowError> {
        let blueprint = blueprint.sanitized()?;
        blueprint.validate()?;
        let serializer = self.services.serializer.clone();
        let state = if serialized_context.trim().is_empty() {
            WorkflowState::new(Context::new())
        } else {
            WorkflowState::from_serialized(serialized_context, serializer.as_ref())?
        };
        let execution_id = Uuid::new_v4().to_string();
        state
            .bind_bus(self.services.event_bus.clone(), execution_id.clone())
            .await;
        let def = blueprint.node(node_id).cloned().ok_or_else(|| {
            WorkflowError::Configuration(format!("node '{node_id}' not in blueprint"))
        })?;
        let strict = options.strict.unwrap_or(self.strict);
        let ecx = self.execution_context(
            execution_id.clone(),
            blueprint.clone(),
            state,
            &options,
            strict,
        );

        let result = match NodeExecutor::new(ecx.clone(), def.clone()).execute().await {
            NodeOutcome::Success(result) => {
                let mut state = ecx.state.write().await;
                state.record_completion(node_id, result.output.clone()).await;
                result
            }
            NodeOutcome::Awaiting => NodeResult::empty(),
            NodeOutcome::FailedWithFallback { error, fallback } => {
                let fallback_def = blueprint.node(&fallback).cloned().ok_or_else(|| {
                    WorkflowError::Configuration(format!(
                        "fallback node '{fallback}' not in blueprint"
                    ))
                })?;
                match NodeExecutor::new(ecx.clone(), fallback_def).execute().await {
                    NodeOutcome::Success(fallback_result) => {
                        let mut state = ecx.state.write().await;
                        state
                            .record_completion(node_id, fallback_result.output.clone())
                            .await;
                        state
                            .record_completion(&fallback, fallback_result.output.clone())
                            .await;
                        state.set_fallback_executed();
                        NodeResult {
                            fallback_executed: true,
                            ..fallback_result
                        }
                    }
                    NodeOutcome::Failed(fallback_error)
                    | NodeOutcome::FailedWithFallback {
                        error: fallback_error,
                        ..
                    } => return Err(error.with_cause(fallback_error)),
                    NodeOutcome::Awaiting => NodeResult::empty(),
                }
            }
            NodeOutcome::Failed(error) => return Err(error),
        };

        let state = ecx.state.read().await;
        let status = state.derive_status(false, blueprint.nodes.len());
        let snapshot = state
            .build_result(status, serializer.as_ref(), &execution_id)
            .await?;
        Ok(NodeExecution {
            result,
            serialized_context: snapshot.serialized_context,
        })
    }

    fn initial_context(&self, initial: InitialState) -> Result<Context, WorkflowError> {
        Ok(match initial {
            InitialState::Empty => Context::new(),
            InitialState::Serialized(text) => {
                Context::from_json(&self.services.serializer.deserialize(&text)?)
            }
            InitialState::Values(value) => Context::from_json(&value),
        })
    }

    fn execution_context(
        &self,
        execution_id: String,
        blueprint: Blueprint,
        state: WorkflowState,
        options: &RunOptions,
        strict: bool,
    ) -> ExecutionContext {
        let registry = match &options.registry {
            Some(overlay) => Arc::new(self.registry.merged(overlay)),
            None => self.registry.clone(),
        };
        ExecutionContext {
            execution_id,
            blueprint: Arc::new(blueprint),
            state: Arc::new(RwLock::new(state)),
            registry,
            services: self.services.clone(),
            blueprints: self.blueprints.clone(),
            cancellation: options.signal.clone().unwrap_or_default(),
            concurrency: options.concurrency.unwrap_or_else(default_concurrency),
            strict,
        }
    }

    async fn resume_subflow(
        &self,
        node_def: &craftcore::NodeDef,
        state: &WorkflowState,
        resume_data: &ResumeData,
        options: &RunOptions,
    ) -> Result<Option<SubflowResumption>, WorkflowError> {
        let sub_key = format!("{SUBFLOW_STATE_PREFIX}{}", node_def.id);
        let Some(Value::String(sub_text)) = state.view().get(&sub_key).await else {
            return Ok(None);
        };
        let sub_blueprint_id = node_def
            .params
            .as_ref()
            .and_then(|p| p.get("blueprintId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                WorkflowError::Configuration(format!(
                    "subflow node '{}' is missing blueprintId",
                    node_def.id
                ))
            })?;
        let sub_blueprint = self.blueprint(&sub_blueprint_id).await.ok_or_else(|| {
            WorkflowError::Configuration(format!("unknown blueprint '{sub_blueprint_id}'"))
        })?;

        let sub_result = Box::pin(self.resume(
            &sub_blueprint,
            &sub_text,
            resume_data.clone(),
            None,
            options.clone(),
        ))
        .await?;

        match sub_result.status {
            WorkflowStatus::Awaiting => {
                state
                    .view()
                    .set(sub_key, Value::String(sub_result.serialized_context))
                    .await;
                Ok(Some(SubflowResumption::StillAwaiting))
            }
            WorkflowStatus::Completed => {
                let sub_analysis = GraphAnalysis::analyze(&sub_blueprint.sanitized()?);
                let extracted = extract_subflow_output(
                    node_def.params.as_ref().and_then(|p| p.get("outputs")),
                    &sub_result.context,
                    &sub_analysis.terminal_node_ids,
                    &state.view(),
                )
                .await;
                state.view().delete(&sub_key).await;
                Ok(Some(SubflowResumption::Completed(extracted)))
            }
            other => Err(WorkflowError::node(
                node_def.id.clone(),
                format!("subflow resume ended with status {other:?}"),
            )),
        }
    }

    /// Workflow-level event emission and scheduler registration around an
    /// orchestrator outcome. Cancellation becomes a `cancelled` result with
    /// an empty context.
    async fn finalize(
        &self,
        ecx: ExecutionContext,
        outcome: Result<WorkflowResult, WorkflowError>,
    ) -> Result<WorkflowResult, WorkflowError> {
        let blueprint_id = ecx.blueprint_id().to_string();
        let execution_id = ecx.execution_id.clone();
        match outcome {
            Ok(result) => {
                match result.status {
                    WorkflowStatus::Stalled => {
                        let completed = ecx.state.read().await.completed().clone();
                        let remaining: Vec<String> = ecx
                            .blueprint
                            .nodes
                            .iter()
                            .filter(|n| !completed.contains(&n.id))
                            .map(|n| n.id.clone())
                            .collect();
                        tracing::warn!(blueprint_id = %blueprint_id, ?remaining, "workflow stalled");
                        ecx.emit(FlowcraftEvent::WorkflowStall {
                            blueprint_id: blueprint_id.clone(),
                            execution_id: execution_id.clone(),
                            remaining_nodes: remaining,
                        });
                        ecx.emit(FlowcraftEvent::WorkflowPause {
                            blueprint_id: blueprint_id.clone(),
                            execution_id: execution_id.clone(),
                            awaiting_node_ids: Vec::new(),
                        });
                    }
                    WorkflowStatus::Awaiting => {
                        let awaiting = ecx.state.read().await.awaiting().to_vec();
                        ecx.emit(FlowcraftEvent::WorkflowPause {
                            blueprint_id: blueprint_id.clone(),
                            execution_id: execution_id.clone(),
                            awaiting_node_ids: awaiting.iter().map(|(id, _)| id.clone()).collect(),
                        });
                        if let Some(scheduler) = self.scheduler() {
                            for (node_id, info) in &awaiting {
                                if info.reason != AwaitReason::Timer {
                                    continue;
                                }
                                let Some(wake_up_at) = info.wake_up_at else {
                                    continue;
                                };
                                scheduler.track(
                                    execution_id.clone(),
                                    ScheduledResume {
                                        blueprint_id: blueprint_id.clone(),
                                        serialized_context: result.serialized_context.clone(),
                                        awaiting_node_id: node_id.clone(),
                                        wake_up_at,
                                    },
                                );
                            }
                        }
                    }
                    _ => {}
                }
                tracing::info!(
                    blueprint_id = %blueprint_id,
                    execution_id = %execution_id,
                    status = ?result.status,
                    "workflow finished"
                );
                ecx.emit(FlowcraftEvent::WorkflowFinish {
                    blueprint_id,
                    execution_id,
                    status: result.status,
                    errors: result.errors.clone(),
                });
                Ok(result)
            }
            Err(error) if error.is_cancelled() => {
                let record = ErrorRecord::from_error(&error)
                    .with_blueprint(blueprint_id.clone())
                    .with_execution(execution_id.clone());
                tracing::warn!(blueprint_id = %blueprint_id, "workflow cancelled");
                ecx.emit(FlowcraftEvent::WorkflowPause {
                    blueprint_id: blueprint_id.clone(),
                    execution_id: execution_id.clone(),
                    awaiting_node_ids: Vec::new(),
                });
                ecx.emit(FlowcraftEvent::WorkflowFinish {
                    blueprint_id,
                    execution_id,
                    status: WorkflowStatus::Cancelled,
                    errors: vec![record.clone()],
                });
                Ok(WorkflowResult {
                    context: Value::Object(serde_json::Map::new()),
                    serialized_context: "{}".to_string(),
                    status: WorkflowStatus::Cancelled,
                    errors: vec![record],
                })
            }
            Err(error) => Err(error),
        }
    }
}

impl Default for FlowcraftRuntime {
    fn default() -> Self {
        Self::new()
    }
}

enum SubflowResumption {
    StillAwaiting,
    Completed(Value),
}
