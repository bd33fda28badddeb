use crate::evaluator::truthy;
use crate::execution::ExecutionContext;
use crate::routing::context_scope;
use craftcore::{NodeContext, NodeDef, NodeResult, WorkflowError};
use serde_json::Value;

/// Evaluates `params.condition` against the current context and produces a
/// `continue` or `break` action for edge routing.
pub async fn run(
    ecx: &ExecutionContext,
    def: &NodeDef,
    nctx: &NodeContext,
) -> Result<NodeResult, WorkflowError> {
    let condition = nctx
        .require_param("condition")?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "node '{}': condition must be a string",
                def.id
            ))
        })?;

    let context_json = nctx.context.to_json().await;
    let scope = context_scope(&context_json);
    let verdict = ecx
        .services
        .evaluator
        .evaluate(&condition, &scope)
        .map(|value| truthy(&value))?;

    tracing::debug!(node_id = %def.id, condition = %condition, verdict, "loop condition");
    if verdict {
        Ok(NodeResult::empty().with_action("continue"))
    } else {
        Ok(NodeResult {
            output: Some(Value::Null),
            action: Some("break".to_string()),
            ..Default::default()
        })
    }
}
