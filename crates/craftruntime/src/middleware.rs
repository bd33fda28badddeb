use async_trait::async_trait;
use craftcore::{NodeContext, NodeResult, WorkflowError};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Hooks around node execution. All `before` hooks run in registration
/// order, `around` hooks wrap the core LIFO (first registered outermost),
/// and all `after` hooks run in registration order with the outcome.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before(&self, _ctx: &NodeContext) -> Result<(), WorkflowError> {
        Ok(())
    }

    async fn around(&self, _ctx: &NodeContext, next: Next) -> Result<NodeResult, WorkflowError> {
        next.run().await
    }

    async fn after(&self, _ctx: &NodeContext, _outcome: &Result<NodeResult, WorkflowError>) {}
}

type Continuation =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<NodeResult, WorkflowError>> + Send>;

/// Explicit continuation handed to `around` hooks.
pub struct Next {
    inner: Continuation,
}

impl Next {
    pub fn new(
        f: impl FnOnce() -> BoxFuture<'static, Result<NodeResult, WorkflowError>> + Send + 'static,
    ) -> Self {
        Self { inner: Box::new(f) }
    }

    pub async fn run(self) -> Result<NodeResult, WorkflowError> {
        (self.inner)().await
    }
}

/// Runs `core` under the full middleware chain. `after` hooks always run,
/// whether the chain produced a result or an error.
pub async fn run_chain(
    middleware: &[Arc<dyn Middleware>],
    ctx: &NodeContext,
    core: impl FnOnce() -> BoxFuture<'static, Result<NodeResult, WorkflowError>> + Send + 'static,
) -> Result<NodeResult, WorkflowError> {
    let mut before_error = None;
    for mw in middleware {
        if let Err(error) = mw.before(ctx).await {
            before_error = Some(error);
            break;
        }
    }

    let outcome = match before_error {
        Some(error) => Err(error),
        None => {
            let mut next = Next::new(core);
            for mw in middleware.iter().rev() {
                let mw = mw.clone();
                let ctx = ctx.clone();
                let inner = next;
                next = Next::new(move || Box::pin(async move { mw.around(&ctx, inner).await }));
            }
            next.run().await
        }
    };

    for mw in middleware {
        mw.after(ctx, &outcome).await;
    }

    outcome
}
