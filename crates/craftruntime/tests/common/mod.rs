#![allow(dead_code)]

use craftcore::{handler_fn, CollectingEventBus, NodeResult, WorkflowError};
use craftruntime::{FlowcraftRuntime, NodeRegistry, RuntimeConfig};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Runtime wired to a collecting bus so tests can assert on the stream.
pub fn runtime_with(registry: NodeRegistry) -> (Arc<FlowcraftRuntime>, Arc<CollectingEventBus>) {
    let bus = Arc::new(CollectingEventBus::new());
    let runtime = FlowcraftRuntime::with_config(RuntimeConfig {
        registry,
        event_bus: Some(bus.clone()),
        ..Default::default()
    });
    (Arc::new(runtime), bus)
}

/// Registry with small general-purpose nodes used across the suite.
pub fn base_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();

    // Emits params.value verbatim.
    registry.register_function(
        "emit",
        handler_fn(|ctx| async move {
            Ok(NodeResult {
                output: ctx.param("value").cloned(),
                ..Default::default()
            })
        }),
    );

    // Appends params.suffix to a string input.
    registry.register_function(
        "append",
        handler_fn(|ctx| async move {
            let input = ctx
                .input
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let suffix = ctx
                .param("suffix")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(NodeResult::with_output(json!(format!("{input}{suffix}"))))
        }),
    );

    // Doubles a numeric input.
    registry.register_function(
        "double",
        handler_fn(|ctx| async move {
            let n = ctx.input.as_ref().and_then(Value::as_f64).ok_or_else(|| {
                WorkflowError::node(ctx.node_id.clone(), "double requires a number")
            })?;
            Ok(NodeResult::with_output(json!(n * 2.0)))
        }),
    );

    // Increments the context key named by params.key.
    registry.register_function(
        "increment",
        handler_fn(|ctx| async move {
            let key = ctx
                .param("key")
                .and_then(Value::as_str)
                .unwrap_or("counter")
                .to_string();
            let current = ctx
                .context
                .get(&key)
                .await
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            ctx.context.set(key, json!(current + 1)).await;
            Ok(NodeResult::with_output(json!(current + 1)))
        }),
    );

    registry
}

pub fn context_value<'a>(context: &'a Value, key: &str) -> Option<&'a Value> {
    context.get(key)
}

pub fn output_of<'a>(context: &'a Value, node_id: &str) -> Option<&'a Value> {
    context.get(format!("_outputs.{node_id}"))
}
