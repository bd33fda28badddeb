use crate::analysis::GraphAnalysis;
use crate::execution::ExecutionContext;
use crate::orchestrator::Orchestrator;
use crate::traverser::GraphTraverser;
use craftcore::{
    input_key, output_key, AsyncContextView, AwaitingInfo, Context, NodeContext, NodeDef,
    NodeResult, WorkflowError, WorkflowState, WorkflowStatus, SUBFLOW_STATE_PREFIX,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Runs a registered blueprint as a single node. An awaiting sub-workflow
/// suspends the parent and parks its serialized context under
/// `_subflowState.<nodeId>`.
pub async fn run(
    ecx: &ExecutionContext,
    def: &NodeDef,
    nctx: &NodeContext,
) -> Result<NodeResult, WorkflowError> {
    let blueprint_id = nctx
        .require_param("blueprintId")?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "node '{}': blueprintId must be a string",
                def.id
            ))
        })?;
    let sub_blueprint = {
        let blueprints = ecx.blueprints.read().await;
        blueprints.get(&blueprint_id).cloned()
    }
    .ok_or_else(|| WorkflowError::Configuration(format!("unknown blueprint '{blueprint_id}'")))?;

    let sub_blueprint = sub_blueprint.sanitized()?;
    sub_blueprint.validate()?;
    let analysis = GraphAnalysis::analyze(&sub_blueprint);
    let sub_execution_id = format!("{}:{}", ecx.execution_id, def.id);

    let mut initial = Context::new();
    match (&def.inputs, &nctx.input) {
        // An explicit inputs mapping resolves to an object whose entries
        // seed the sub context directly.
        (Some(craftcore::InputSpec::Map(_)), Some(Value::Object(entries))) => {
            for (key, value) in entries {
                initial.set(key.clone(), value.clone());
            }
        }
        _ => {
            for start in &analysis.start_node_ids {
                initial.set(
                    input_key(start),
                    nctx.input.clone().unwrap_or(Value::Null),
                );
            }
        }
    }
    initial.bind_bus(ecx.services.event_bus.clone(), sub_execution_id.clone());

    let sub_ecx = ExecutionContext {
        execution_id: sub_execution_id,
        blueprint: Arc::new(sub_blueprint.clone()),
        state: Arc::new(RwLock::new(WorkflowState::new(initial))),
        registry: ecx.registry.clone(),
        services: ecx.services.clone(),
        blueprints: ecx.blueprints.clone(),
        cancellation: ecx.cancellation.clone(),
        concurrency: ecx.concurrency,
        strict: ecx.strict,
    };
    let traverser = GraphTraverser::new(sub_blueprint, &analysis, ecx.strict, HashSet::new());

    tracing::debug!(node_id = %def.id, blueprint_id = %blueprint_id, "running subflow");
    let sub_result = Orchestrator::new(sub_ecx, traverser).run().await?;

    match sub_result.status {
        WorkflowStatus::Awaiting => {
            let mut state = ecx.state.write().await;
            state.mark_awaiting(&def.id, AwaitingInfo::subflow()).await;
            drop(state);
            nctx.context
                .set(
                    format!("{SUBFLOW_STATE_PREFIX}{}", def.id),
                    Value::String(sub_result.serialized_context),
                )
                .await;
            Ok(NodeResult::empty())
        }
        WorkflowStatus::Completed => {
            let output = extract_subflow_output(
                nctx.param("outputs"),
                &sub_result.context,
                &analysis.terminal_node_ids,
                &nctx.context,
            )
            .await;
            Ok(NodeResult {
                output: Some(output),
                ..Default::default()
            })
        }
        WorkflowStatus::Failed => Err(WorkflowError::node(
            def.id.clone(),
            format!("subflow '{blueprint_id}' failed"),
        )),
        WorkflowStatus::Stalled => Err(WorkflowError::node(
            def.id.clone(),
            format!("subflow '{blueprint_id}' stalled"),
        )),
        WorkflowStatus::Cancelled => Err(WorkflowError::cancelled_at(&def.id)),
    }
}

/// Maps a completed sub-workflow's context onto the parent.
///
/// With a `params.outputs` mapping, each parent key is assigned from the sub
/// context (outputs namespace first) and the full sub context is returned.
/// Otherwise a single terminal's output is returned directly, or an object
/// keyed by terminal id when there are several.
pub(crate) async fn extract_subflow_output(
    outputs_param: Option<&Value>,
    sub_context: &Value,
    terminal_ids: &[String],
    parent_view: &AsyncContextView,
) -> Value {
    if let Some(mapping) = outputs_param.and_then(Value::as_object) {
        for (parent_key, sub_key) in mapping {
            if let Some(sub_key) = sub_key.as_str() {
                let value = sub_context
                    .get(output_key(sub_key))
                    .or_else(|| sub_context.get(sub_key))
                    .cloned()
                    .unwrap_or(Value::Null);
                parent_view.set(parent_key.clone(), value).await;
            }
        }
        return sub_context.clone();
    }
    if let [terminal] = terminal_ids {
        return sub_context
            .get(output_key(terminal))
            .cloned()
            .unwrap_or(Value::Null);
    }
    Value::Object(
        terminal_ids
            .iter()
            .map(|terminal| {
                (
                    terminal.clone(),
                    sub_context
                        .get(output_key(terminal))
                        .cloned()
                        .unwrap_or(Value::Null),
                )
            })
            .collect(),
    )
}
