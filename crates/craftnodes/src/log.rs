use craftcore::{NodeContext, NodeResult, WorkflowError};
use serde_json::Value;

/// Logs its input (or `params.message`) and passes the input through.
pub async fn log_node(ctx: NodeContext) -> Result<NodeResult, WorkflowError> {
    let message = ctx
        .param("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| ctx.input.as_ref().map(|v| v.to_string()))
        .unwrap_or_else(|| "(no message)".to_string());
    tracing::info!(node_id = %ctx.node_id, "{message}");
    Ok(NodeResult {
        output: ctx.input.clone(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::node_ctx;
    use serde_json::json;

    #[tokio::test]
    async fn passes_input_through() {
        let ctx = node_ctx("logger", Some(json!({"k": 1})), Value::Null).await;
        let result = log_node(ctx).await.unwrap();
        assert_eq!(result.output, Some(json!({"k": 1})));
    }
}
