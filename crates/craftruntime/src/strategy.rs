use craftcore::{
    EventBus, FlowcraftEvent, LifecycleFactory, LifecycleNode, NodeConfig, NodeContext,
    NodeHandler, NodeResult, WorkflowError,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Bounds one attempt with the configured timeout and races it against the
/// run's cancellation token so in-flight work observes cancellation promptly.
async fn run_attempt<T>(
    ctx: &NodeContext,
    config: &NodeConfig,
    attempt: impl Future<Output = Result<T, WorkflowError>>,
) -> Result<T, WorkflowError> {
    let node_id = ctx.node_id.clone();
    let bounded = async {
        match config.timeout {
            Some(timeout_ms) => timeout(Duration::from_millis(timeout_ms), attempt)
                .await
                .unwrap_or_else(|_| {
                    Err(WorkflowError::Timeout {
                        node_id: node_id.clone(),
                        timeout_ms,
                    })
                }),
            None => attempt.await,
        }
    };
    tokio::select! {
        _ = ctx.cancellation.cancelled() => Err(WorkflowError::cancelled_at(&ctx.node_id)),
        outcome = bounded => outcome,
    }
}

fn attempts_of(config: &NodeConfig) -> u32 {
    config.max_retries.unwrap_or(1).max(1)
}

/// Function strategy: retry the whole handler call until attempts are
/// exhausted; fatal errors and cancellation stop retrying immediately.
pub async fn run_function_strategy(
    handler: &Arc<dyn NodeHandler>,
    ctx: &NodeContext,
    config: &NodeConfig,
    bus: &Arc<dyn EventBus>,
) -> Result<NodeResult, WorkflowError> {
    let attempts = attempts_of(config);
    let delay_ms = config.retry_delay.unwrap_or(0);
    let mut attempt = 1u32;
    loop {
        if ctx.cancellation.is_cancelled() {
            return Err(WorkflowError::cancelled_at(&ctx.node_id));
        }
        match run_attempt(ctx, config, handler.call(ctx.clone())).await {
            Ok(result) => return Ok(result),
            Err(error) if error.is_cancelled() || error.is_fatal() => return Err(error),
            Err(error) => {
                if attempt >= attempts {
                    return Err(error);
                }
                tracing::debug!(node_id = %ctx.node_id, attempt, error = %error, "retrying node");
                bus.emit(FlowcraftEvent::NodeRetry {
                    blueprint_id: ctx.blueprint_id.clone(),
                    execution_id: ctx.execution_id.clone(),
                    node_id: ctx.node_id.clone(),
                    attempt,
                });
                if delay_ms > 0 {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Lifecycle strategy: prep, exec under the retry policy, the instance's
/// own fallback on exec exhaustion, post, and a terminal recover hook that
/// fires whenever any phase errored (even if the fallback recovered the
/// pipeline). Errors from recover are logged and never rethrown.
pub async fn run_lifecycle_strategy(
    factory: &Arc<dyn LifecycleFactory>,
    ctx: &NodeContext,
    config: &NodeConfig,
    bus: &Arc<dyn EventBus>,
) -> Result<NodeResult, WorkflowError> {
    let mut node = factory.instantiate(&ctx.params, &ctx.node_id);
    let mut last_error = None;
    let outcome = run_lifecycle_phases(node.as_mut(), ctx, config, bus, &mut last_error).await;
    if let Some(error) = &last_error {
        if let Err(recover_error) = node.recover(error, ctx).await {
            tracing::warn!(
                node_id = %ctx.node_id,
                error = %recover_error,
                "recover hook failed"
            );
        }
    }
    outcome
}

/// Every phase failure is noted in `last_error`, including exec attempts
/// that a retry or the fallback later absorbed.
async fn run_lifecycle_phases(
    node: &mut dyn LifecycleNode,
    ctx: &NodeContext,
    config: &NodeConfig,
    bus: &Arc<dyn EventBus>,
    last_error: &mut Option<WorkflowError>,
) -> Result<NodeResult, WorkflowError> {
    let prep = match node.prep(ctx).await {
        Ok(value) => value,
        Err(error) => {
            *last_error = Some(error.clone());
            return Err(error);
        }
    };

    let attempts = attempts_of(config);
    let delay_ms = config.retry_delay.unwrap_or(0);
    let mut attempt = 1u32;
    let exec_outcome: Result<Value, WorkflowError> = loop {
        if ctx.cancellation.is_cancelled() {
            break Err(WorkflowError::cancelled_at(&ctx.node_id));
        }
        match run_attempt(ctx, config, node.exec(prep.clone(), ctx)).await {
            Ok(value) => break Ok(value),
            Err(error) if error.is_cancelled() || error.is_fatal() => break Err(error),
            Err(error) => {
                *last_error = Some(error.clone());
                if attempt >= attempts {
                    break Err(error);
                }
                bus.emit(FlowcraftEvent::NodeRetry {
                    blueprint_id: ctx.blueprint_id.clone(),
                    execution_id: ctx.execution_id.clone(),
                    node_id: ctx.node_id.clone(),
                    attempt,
                });
                if delay_ms > 0 {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                attempt += 1;
            }
        }
    };

    let exec_value = match exec_outcome {
        Ok(value) => value,
        Err(error) if error.is_cancelled() || error.is_fatal() => {
            *last_error = Some(error.clone());
            return Err(error);
        }
        Err(error) => match node.fallback(error, ctx).await {
            Ok(value) => value,
            Err(fallback_error) => {
                *last_error = Some(fallback_error.clone());
                return Err(fallback_error);
            }
        },
    };

    match node.post(exec_value, ctx).await {
        Ok(result) => Ok(result),
        Err(error) => {
            *last_error = Some(error.clone());
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use craftcore::{
        handler_fn, AsyncContextView, Context, Dependencies, NullEventBus, WorkflowState,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    async fn test_ctx() -> NodeContext {
        let state = Arc::new(RwLock::new(WorkflowState::new(Context::new())));
        let handle = state.read().await.context_handle();
        NodeContext {
            node_id: "flaky".into(),
            blueprint_id: "bp".into(),
            execution_id: "exec".into(),
            context: AsyncContextView::new(handle),
            input: None,
            params: Value::Null,
            dependencies: Arc::new(Dependencies::new()),
            state,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn function_strategy_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let handler = handler_fn(move |_ctx| {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(WorkflowError::node("flaky", "transient"))
                } else {
                    Ok(NodeResult::with_output(json!("ok")))
                }
            }
        });
        let bus: Arc<dyn EventBus> = Arc::new(NullEventBus);
        let config = NodeConfig {
            max_retries: Some(2),
            ..Default::default()
        };
        let ctx = test_ctx().await;
        let result = run_function_strategy(&handler, &ctx, &config, &bus)
            .await
            .unwrap();
        assert_eq!(result.output, Some(json!("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_stop_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let handler = handler_fn(move |_ctx| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<NodeResult, _>(WorkflowError::fatal_node("flaky", "hard failure"))
            }
        });
        let bus: Arc<dyn EventBus> = Arc::new(NullEventBus);
        let config = NodeConfig {
            max_retries: Some(5),
            ..Default::default()
        };
        let ctx = test_ctx().await;
        let error = run_function_strategy(&handler, &ctx, &config, &bus)
            .await
            .unwrap_err();
        assert!(error.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_produces_retriable_error() {
        let handler = handler_fn(|_ctx| async {
            sleep(Duration::from_secs(5)).await;
            Ok(NodeResult::empty())
        });
        let bus: Arc<dyn EventBus> = Arc::new(NullEventBus);
        let config = NodeConfig {
            timeout: Some(20),
            ..Default::default()
        };
        let ctx = test_ctx().await;
        let error = run_function_strategy(&handler, &ctx, &config, &bus)
            .await
            .unwrap_err();
        assert!(matches!(error, WorkflowError::Timeout { .. }));
        assert!(!error.is_fatal());
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_attempt() {
        let handler = handler_fn(|_ctx| async {
            sleep(Duration::from_secs(60)).await;
            Ok(NodeResult::empty())
        });
        let bus: Arc<dyn EventBus> = Arc::new(NullEventBus);
        let config = NodeConfig::default();
        let ctx = test_ctx().await;
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let error = run_function_strategy(&handler, &ctx, &config, &bus)
            .await
            .unwrap_err();
        assert!(error.is_cancelled());
    }

    struct Phases {
        log: Arc<Mutex<Vec<String>>>,
        fail_exec: bool,
    }

    #[async_trait]
    impl LifecycleNode for Phases {
        async fn prep(&mut self, _ctx: &NodeContext) -> Result<Value, WorkflowError> {
            self.log.lock().unwrap().push("prep".into());
            Ok(json!("prepared"))
        }

        async fn exec(&mut self, prep: Value, _ctx: &NodeContext) -> Result<Value, WorkflowError> {
            self.log.lock().unwrap().push("exec".into());
            if self.fail_exec {
                Err(WorkflowError::node("n", "exec failed"))
            } else {
                Ok(json!(format!("{}+done", prep.as_str().unwrap())))
            }
        }

        async fn post(&mut self, exec: Value, _ctx: &NodeContext) -> Result<NodeResult, WorkflowError> {
            self.log.lock().unwrap().push("post".into());
            Ok(NodeResult::with_output(exec))
        }

        async fn fallback(
            &mut self,
            _error: WorkflowError,
            _ctx: &NodeContext,
        ) -> Result<Value, WorkflowError> {
            self.log.lock().unwrap().push("fallback".into());
            Ok(json!("recovered"))
        }

        async fn recover(
            &mut self,
            error: &WorkflowError,
            _ctx: &NodeContext,
        ) -> Result<(), WorkflowError> {
            self.log.lock().unwrap().push(format!("recover:{error}"));
            Ok(())
        }
    }

    struct PhasesFactory {
        log: Arc<Mutex<Vec<String>>>,
        fail_exec: bool,
    }

    impl LifecycleFactory for PhasesFactory {
        fn instantiate(&self, _params: &Value, _node_id: &str) -> Box<dyn LifecycleNode> {
            Box::new(Phases {
                log: self.log.clone(),
                fail_exec: self.fail_exec,
            })
        }
    }

    #[tokio::test]
    async fn lifecycle_happy_path_runs_prep_exec_post() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory: Arc<dyn LifecycleFactory> = Arc::new(PhasesFactory {
            log: log.clone(),
            fail_exec: false,
        });
        let bus: Arc<dyn EventBus> = Arc::new(NullEventBus);
        let ctx = test_ctx().await;
        let result = run_lifecycle_strategy(&factory, &ctx, &NodeConfig::default(), &bus)
            .await
            .unwrap();
        assert_eq!(result.output, Some(json!("prepared+done")));
        assert_eq!(*log.lock().unwrap(), vec!["prep", "exec", "post"]);
    }

    #[tokio::test]
    async fn lifecycle_fallback_resumes_at_post_without_retrying_prep() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory: Arc<dyn LifecycleFactory> = Arc::new(PhasesFactory {
            log: log.clone(),
            fail_exec: true,
        });
        let bus: Arc<dyn EventBus> = Arc::new(NullEventBus);
        let config = NodeConfig {
            max_retries: Some(2),
            ..Default::default()
        };
        let ctx = test_ctx().await;
        let result = run_lifecycle_strategy(&factory, &ctx, &config, &bus)
            .await
            .unwrap();
        assert_eq!(result.output, Some(json!("recovered")));
        // prep once, exec retried twice, fallback, post. recover still fires
        // with the exec error even though the fallback absorbed it.
        let log = log.lock().unwrap();
        assert_eq!(
            log[..5],
            ["prep", "exec", "exec", "fallback", "post"].map(String::from)
        );
        assert_eq!(log.len(), 6);
        assert!(
            log[5].starts_with("recover:") && log[5].contains("exec failed"),
            "recover must receive the exec error, got {:?}",
            log[5]
        );
    }
}
