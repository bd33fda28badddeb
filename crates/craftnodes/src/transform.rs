use craftcore::{NodeContext, NodeResult, WorkflowError};
use serde_json::Value;

/// Parses a JSON string input into a value.
pub async fn json_parse(ctx: NodeContext) -> Result<NodeResult, WorkflowError> {
    let text = ctx
        .input
        .as_ref()
        .and_then(Value::as_str)
        .ok_or_else(|| WorkflowError::node(ctx.node_id.clone(), "json-parse requires a string input"))?;
    let parsed: Value = serde_json::from_str(text)
        .map_err(|e| WorkflowError::node(ctx.node_id.clone(), format!("JSON parse error: {e}")))?;
    Ok(NodeResult::with_output(parsed))
}

/// Renders any input value as a JSON string.
pub async fn json_stringify(ctx: NodeContext) -> Result<NodeResult, WorkflowError> {
    let value = ctx.input.clone().unwrap_or(Value::Null);
    let text = serde_json::to_string_pretty(&value)
        .map_err(|e| WorkflowError::node(ctx.node_id.clone(), format!("JSON stringify error: {e}")))?;
    Ok(NodeResult::with_output(Value::String(text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::node_ctx;
    use serde_json::json;

    #[tokio::test]
    async fn parse_and_stringify_round_trip() {
        let ctx = node_ctx("p", Some(json!("{\"a\":[1,2]}")), Value::Null).await;
        let parsed = json_parse(ctx).await.unwrap();
        assert_eq!(parsed.output, Some(json!({"a": [1, 2]})));

        let ctx = node_ctx("s", parsed.output, Value::Null).await;
        let text = json_stringify(ctx).await.unwrap();
        let rendered: Value =
            serde_json::from_str(text.output.unwrap().as_str().unwrap()).unwrap();
        assert_eq!(rendered, json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn parse_rejects_non_string_input() {
        let ctx = node_ctx("p", Some(json!(42)), Value::Null).await;
        assert!(json_parse(ctx).await.is_err());
    }
}
