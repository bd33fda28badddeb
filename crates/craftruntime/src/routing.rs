use crate::evaluator::truthy;
use crate::execution::ExecutionContext;
use crate::traverser::GraphTraverser;
use craftcore::{input_key, EdgeDef, FlowcraftEvent, NodeResult, WorkflowError};
use serde_json::Value;

/// Scope for edge conditions: the flat context keys as top-level bindings,
/// plus `context` (full context JSON) and `result` (the node's result).
pub(crate) fn edge_scope(context_json: &Value, result: &NodeResult) -> Value {
    let mut scope = flatten(context_json);
    scope.insert("context".to_string(), context_json.clone());
    scope.insert(
        "result".to_string(),
        serde_json::to_value(result).unwrap_or(Value::Null),
    );
    Value::Object(scope)
}

/// Scope for loop-controller conditions: flat keys plus `context`.
pub(crate) fn context_scope(context_json: &Value) -> Value {
    let mut scope = flatten(context_json);
    scope.insert("context".to_string(), context_json.clone());
    Value::Object(scope)
}

fn flatten(context_json: &Value) -> serde_json::Map<String, Value> {
    context_json
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// Selects the outgoing edges of a just-completed node.
///
/// With a string action, only same-action edges are candidates; if none
/// survives its condition, the default (action-less) edges are evaluated
/// instead. Kept edges emit `edge:evaluate`, dropped ones `node:skipped`.
pub async fn determine_next_nodes(
    ecx: &ExecutionContext,
    traverser: &GraphTraverser,
    node_id: &str,
    result: &NodeResult,
) -> Vec<EdgeDef> {
    let edges: Vec<EdgeDef> = traverser
        .blueprint()
        .edges_from(node_id)
        .cloned()
        .collect();
    if edges.is_empty() {
        return Vec::new();
    }

    let context_json = {
        let state = ecx.state.read().await;
        state.view().to_json().await
    };
    let scope = edge_scope(&context_json, result);

    let mut selected = Vec::new();
    let mut skipped = Vec::new();

    if let Some(action) = result.action.as_deref() {
        let (actioned, rest): (Vec<EdgeDef>, Vec<EdgeDef>) = edges
            .into_iter()
            .partition(|e| e.action.as_deref() == Some(action));
        for edge in actioned {
            if condition_holds(ecx, &edge, &scope) {
                selected.push(edge);
            } else {
                skipped.push(edge);
            }
        }
        if selected.is_empty() {
            for edge in rest {
                if edge.action.is_none() && condition_holds(ecx, &edge, &scope) {
                    selected.push(edge);
                } else {
                    skipped.push(edge);
                }
            }
        } else {
            skipped.extend(rest);
        }
    } else {
        for edge in edges {
            if edge.action.is_none() && condition_holds(ecx, &edge, &scope) {
                selected.push(edge);
            } else {
                skipped.push(edge);
            }
        }
    }

    for edge in &selected {
        ecx.emit(FlowcraftEvent::EdgeEvaluate {
            blueprint_id: ecx.blueprint_id().to_string(),
            execution_id: ecx.execution_id.clone(),
            source: edge.source.clone(),
            target: edge.target.clone(),
            condition: edge.condition.clone(),
            result: true,
        });
    }
    for edge in &skipped {
        ecx.emit(FlowcraftEvent::NodeSkipped {
            blueprint_id: ecx.blueprint_id().to_string(),
            execution_id: ecx.execution_id.clone(),
            node_id: edge.target.clone(),
            edge: edge.clone(),
        });
    }

    selected
}

fn condition_holds(ecx: &ExecutionContext, edge: &EdgeDef, scope: &Value) -> bool {
    let Some(condition) = edge.condition.as_deref() else {
        return true;
    };
    match ecx.services.evaluator.evaluate(condition, scope) {
        Ok(value) => truthy(&value),
        Err(error) => {
            tracing::warn!(
                source = %edge.source,
                target = %edge.target,
                condition,
                error = %error,
                "edge condition failed to evaluate"
            );
            false
        }
    }
}

/// Stages the source's output (optionally transformed) as the target's
/// input. Writes only `_inputs.<target>`; a target with author-declared
/// inputs, or several predecessors and no transform, is left alone.
pub async fn apply_edge_transform(
    ecx: &ExecutionContext,
    traverser: &mut GraphTraverser,
    edge: &EdgeDef,
    source_result: &NodeResult,
) -> Result<(), WorkflowError> {
    let target = edge.target.as_str();
    if traverser.node(target).is_none() || traverser.has_explicit_inputs(target) {
        return Ok(());
    }
    if traverser.predecessor_count(target) > 1 && edge.transform.is_none() {
        return Ok(());
    }

    let final_input = match edge.transform.as_deref() {
        Some(transform) => {
            let context_json = {
                let state = ecx.state.read().await;
                state.view().to_json().await
            };
            let scope = serde_json::json!({
                "input": source_result.output.clone().unwrap_or(Value::Null),
                "context": context_json,
            });
            ecx.services.evaluator.evaluate(transform, &scope)?
        }
        None => source_result.output.clone().unwrap_or(Value::Null),
    };

    {
        let state = ecx.state.read().await;
        state
            .scoped_view(&edge.source)
            .set(input_key(target), final_input)
            .await;
    }
    traverser.set_default_input(target);
    Ok(())
}
