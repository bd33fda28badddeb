use crate::execution::ExecutionContext;
use crate::executor::{NodeExecutor, NodeOutcome};
use crate::routing;
use crate::traverser::GraphTraverser;
use craftcore::{ErrorRecord, NodeResult, WorkflowError, WorkflowResult};
use futures::stream::{FuturesUnordered, StreamExt};

const MAX_ITERATIONS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work remains; call again.
    Progress,
    /// The frontier is empty.
    Quiescent,
    /// At least one node suspended the workflow.
    Awaiting,
}

/// Schedules batches from the frontier with bounded concurrency and
/// serializes result processing between ticks.
pub struct Orchestrator {
    ecx: ExecutionContext,
    traverser: GraphTraverser,
    iterations: u64,
}

impl Orchestrator {
    pub fn new(ecx: ExecutionContext, traverser: GraphTraverser) -> Self {
        Self {
            ecx,
            traverser,
            iterations: 0,
        }
    }

    /// Loops until quiescence, awaiting, or cancellation.
    pub async fn run(mut self) -> Result<WorkflowResult, WorkflowError> {
        loop {
            match self.tick().await? {
                TickOutcome::Progress => {}
                TickOutcome::Quiescent | TickOutcome::Awaiting => break,
            }
        }
        self.interim_result().await
    }

    /// One orchestrator iteration: drain the frontier, execute the batch,
    /// process results.
    pub async fn tick(&mut self) -> Result<TickOutcome, WorkflowError> {
        if self.ecx.cancellation.is_cancelled() {
            return Err(WorkflowError::cancelled());
        }
        self.iterations += 1;
        if self.iterations > MAX_ITERATIONS {
            return Err(WorkflowError::Fatal(format!(
                "workflow exceeded {MAX_ITERATIONS} iterations; infinite loop suspected"
            )));
        }
        if !self.traverser.has_more_work() {
            return Ok(TickOutcome::Quiescent);
        }

        let mut ready = self.traverser.get_ready_nodes();
        let overflow = if ready.len() > self.ecx.concurrency {
            ready.split_off(self.ecx.concurrency)
        } else {
            Vec::new()
        };

        let mut executions = FuturesUnordered::new();
        for (node_id, def) in ready {
            let ecx = self.ecx.clone();
            executions.push(async move {
                let outcome = NodeExecutor::new(ecx, def).execute().await;
                (node_id, outcome)
            });
        }
        let mut settled = Vec::new();
        while let Some(entry) = executions.next().await {
            settled.push(entry);
        }
        drop(executions);

        for (node_id, outcome) in settled {
            self.process(node_id, outcome).await?;
        }

        // Nodes held back by the concurrency cap run next tick.
        for (node_id, _) in overflow {
            self.traverser.add_to_frontier(&node_id);
        }

        if self.ecx.state.read().await.is_awaiting() {
            return Ok(TickOutcome::Awaiting);
        }
        Ok(TickOutcome::Progress)
    }

    async fn process(&mut self, node_id: String, outcome: NodeOutcome) -> Result<(), WorkflowError> {
        match outcome {
            NodeOutcome::Awaiting => Ok(()),
            NodeOutcome::Success(result) => {
                {
                    let mut state = self.ecx.state.write().await;
                    state
                        .record_completion(&node_id, result.output.clone())
                        .await;
                }
                if result.fallback_executed {
                    // The fallback outcome was already folded in upstream;
                    // normal successor wiring must not fire twice.
                    self.traverser.mark_node_completed(&node_id, &result, &[]);
                    return Ok(());
                }
                self.wire_successors(&node_id, &result).await
            }
            NodeOutcome::FailedWithFallback { error, fallback } => {
                self.run_fallback(&node_id, error, fallback).await
            }
            NodeOutcome::Failed(error) => {
                if error.is_cancelled() {
                    return Err(error);
                }
                self.record_error(&node_id, &error).await;
                Ok(())
            }
        }
    }

    /// Completion bookkeeping plus successor scheduling and edge transforms.
    /// Also used by resume to re-wire an externally completed node.
    pub(crate) async fn wire_successors(
        &mut self,
        node_id: &str,
        result: &NodeResult,
    ) -> Result<(), WorkflowError> {
        let edges = routing::determine_next_nodes(&self.ecx, &self.traverser, node_id, result).await;
        let targets: Vec<String> = edges.iter().map(|e| e.target.clone()).collect();
        self.traverser.mark_node_completed(node_id, result, &targets);
        for edge in &edges {
            routing::apply_edge_transform(&self.ecx, &mut self.traverser, edge, result).await?;
        }
        Ok(())
    }

    async fn run_fallback(
        &mut self,
        original: &str,
        error: WorkflowError,
        fallback: String,
    ) -> Result<(), WorkflowError> {
        let Some(fallback_def) = self.traverser.node(&fallback).cloned() else {
            self.record_error(
                original,
                &WorkflowError::Configuration(format!(
                    "fallback node '{fallback}' not found for '{original}'"
                )),
            )
            .await;
            return Ok(());
        };
        tracing::info!(node_id = %original, fallback = %fallback, "running fallback node");

        match NodeExecutor::new(self.ecx.clone(), fallback_def).execute().await {
            NodeOutcome::Success(fallback_result) => {
                {
                    let mut state = self.ecx.state.write().await;
                    state
                        .record_completion(original, fallback_result.output.clone())
                        .await;
                    state
                        .record_completion(&fallback, fallback_result.output.clone())
                        .await;
                    state.set_fallback_executed();
                }
                self.traverser.mark_completed(&fallback);
                // Successors come from the original node's wiring.
                let mut wired = fallback_result;
                wired.fallback_executed = true;
                self.wire_successors(original, &wired).await
            }
            NodeOutcome::Failed(fallback_error)
            | NodeOutcome::FailedWithFallback {
                error: fallback_error,
                ..
            } => {
                if fallback_error.is_cancelled() {
                    return Err(fallback_error);
                }
                self.record_error(original, &error.with_cause(fallback_error))
                    .await;
                Ok(())
            }
            NodeOutcome::Awaiting => Ok(()),
        }
    }

    async fn record_error(&self, node_id: &str, error: &WorkflowError) {
        let record = ErrorRecord::from_error(error)
            .with_node(node_id)
            .with_blueprint(self.ecx.blueprint_id())
            .with_execution(self.ecx.execution_id.clone());
        self.ecx.state.write().await.record_error(record);
    }

    /// Result snapshot for the current state of the traversal.
    pub async fn interim_result(&self) -> Result<WorkflowResult, WorkflowError> {
        let state = self.ecx.state.read().await;
        let status = state.derive_status(
            !self.traverser.has_more_work(),
            self.traverser.total_nodes(),
        );
        state
            .build_result(
                status,
                self.ecx.services.serializer.as_ref(),
                &self.ecx.execution_id,
            )
            .await
    }

    pub fn remaining_nodes(&self) -> Vec<String> {
        self.traverser.remaining_nodes()
    }
}

/// Executes exactly one tick per call; the caller drives the loop.
pub struct StepOrchestrator {
    inner: Orchestrator,
}

/// Interim state after a single tick.
pub struct StepOutcome {
    pub result: WorkflowResult,
    pub done: bool,
}

impl StepOrchestrator {
    pub fn new(ecx: ExecutionContext, traverser: GraphTraverser) -> Self {
        Self {
            inner: Orchestrator::new(ecx, traverser),
        }
    }

    pub async fn step(&mut self) -> Result<StepOutcome, WorkflowError> {
        let tick = self.inner.tick().await?;
        let result = self.inner.interim_result().await?;
        Ok(StepOutcome {
            result,
            done: matches!(tick, TickOutcome::Quiescent | TickOutcome::Awaiting),
        })
    }
}
