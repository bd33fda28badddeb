use crate::execution::ExecutionContext;
use crate::registry::BATCH_SCATTER_USES;
use craftcore::{
    output_key, DynamicNode, FlowcraftEvent, InputSpec, NodeContext, NodeDef, NodeResult,
    WorkflowError,
};
use serde_json::{json, Value};
use uuid::Uuid;

const DEFAULT_CHUNK_SIZE: usize = 10;

/// Fans an array input out into one dynamic worker node per item of the
/// current chunk. Progress keys are stored under the original scatter node's
/// id so continuation scatters share them.
pub async fn run_scatter(
    ecx: &ExecutionContext,
    def: &NodeDef,
    nctx: &NodeContext,
) -> Result<NodeResult, WorkflowError> {
    let items = nctx
        .input
        .as_ref()
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "batch-scatter '{}' requires an array input",
                def.id
            ))
        })?;
    let worker_uses = require_str_param(nctx, def, "worker")?;
    let gather_id = require_str_param(nctx, def, "gatherNodeId")?;
    let chunk_size = nctx
        .param("chunkSize")
        .and_then(Value::as_u64)
        .map(|n| n.max(1) as usize)
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    // Continuation scatters carry the original node id for stable state keys.
    let base = nctx
        .param("stateNodeId")
        .and_then(Value::as_str)
        .unwrap_or(&def.id)
        .to_string();

    let view = &nctx.context;
    let batch_id = match view.get(&format!("{base}_batchId")).await {
        Some(Value::String(existing)) => existing,
        _ => {
            let fresh = Uuid::new_v4().simple().to_string();
            view.set(format!("{base}_batchId"), json!(fresh)).await;
            fresh
        }
    };
    let current = view
        .get(&format!("{base}_currentIndex"))
        .await
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    let end = (current + chunk_size).min(items.len());

    let mut result = NodeResult::empty();
    let mut worker_ids = Vec::with_capacity(end.saturating_sub(current));
    for (i, item) in items.iter().enumerate().take(end).skip(current) {
        let item_key = format!("_batch.{base}_{batch_id}_item_{i}");
        view.set(item_key.clone(), item.clone()).await;
        let worker_id = format!("{worker_uses}_{batch_id}_{i}");
        let worker = NodeDef::new(worker_id.clone(), worker_uses.clone())
            .with_inputs(InputSpec::Key(item_key));
        result.dynamic_nodes.push(DynamicNode {
            def: worker,
            gather: Some(gather_id.clone()),
        });
        worker_ids.push(worker_id);
    }

    view.set(format!("{base}_currentIndex"), json!(end)).await;
    view.set(format!("{gather_id}_hasMore"), json!(end < items.len()))
        .await;
    view.set(format!("{gather_id}_scatterNodeId"), json!(base))
        .await;
    let mut all_workers = view
        .get(&format!("{gather_id}_allWorkerIds"))
        .await
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    all_workers.extend(worker_ids.iter().map(|id| json!(id)));
    view.set(format!("{gather_id}_allWorkerIds"), Value::Array(all_workers))
        .await;

    tracing::debug!(
        scatter = %def.id,
        batch_id = %batch_id,
        workers = worker_ids.len(),
        "scattered batch chunk"
    );
    ecx.emit(FlowcraftEvent::BatchStart {
        execution_id: ecx.execution_id.clone(),
        batch_id,
        scatter_node_id: def.id.clone(),
        worker_node_ids: worker_ids,
    });

    Ok(result)
}

/// Re-aggregates worker outputs. While the scatter reports more chunks, a
/// continuation scatter is spliced in; on the final chunk the collected
/// outputs are written to `params.outputKey` in worker order.
pub async fn run_gather(
    ecx: &ExecutionContext,
    def: &NodeDef,
    nctx: &NodeContext,
) -> Result<NodeResult, WorkflowError> {
    let view = &nctx.context;
    let has_more = view
        .get(&format!("{}_hasMore", def.id))
        .await
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let scatter_id = view
        .get(&format!("{}_scatterNodeId", def.id))
        .await
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "batch-gather '{}' has no recorded scatter node",
                def.id
            ))
        })?;

    if has_more {
        let scatter_def = ecx.blueprint.node(&scatter_id).cloned().ok_or_else(|| {
            WorkflowError::Configuration(format!("scatter node '{scatter_id}' not in blueprint"))
        })?;
        let current = view
            .get(&format!("{scatter_id}_currentIndex"))
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let mut params = scatter_def.params.clone().unwrap_or_else(|| json!({}));
        if let Some(map) = params.as_object_mut() {
            map.insert("stateNodeId".to_string(), json!(scatter_id));
        }
        let continuation = NodeDef {
            id: format!("{scatter_id}_cont_{current}"),
            uses: BATCH_SCATTER_USES.to_string(),
            params: Some(params),
            inputs: scatter_def
                .inputs
                .clone()
                .or(Some(InputSpec::Key(craftcore::input_key(&scatter_id)))),
            config: None,
        };
        return Ok(NodeResult::empty().spawn(DynamicNode {
            def: continuation,
            gather: None,
        }));
    }

    let worker_ids: Vec<String> = view
        .get(&format!("{}_allWorkerIds", def.id))
        .await
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    let mut results = Vec::with_capacity(worker_ids.len());
    for worker_id in &worker_ids {
        results.push(
            view.get(&output_key(worker_id))
                .await
                .unwrap_or(Value::Null),
        );
    }
    let output = Value::Array(results);

    if let Some(output_param) = nctx.param("outputKey").and_then(Value::as_str) {
        view.set(output_param.to_string(), output.clone()).await;
    }

    let batch_id = view
        .get(&format!("{scatter_id}_batchId"))
        .await
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    ecx.emit(FlowcraftEvent::BatchFinish {
        execution_id: ecx.execution_id.clone(),
        batch_id,
        gather_node_id: def.id.clone(),
        results: output.clone(),
    });

    Ok(NodeResult::with_output(output))
}

fn require_str_param(
    nctx: &NodeContext,
    def: &NodeDef,
    name: &str,
) -> Result<String, WorkflowError> {
    nctx.require_param(name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "node '{}': param '{name}' must be a string",
                def.id
            ))
        })
}
