//! Engine-provided node behaviors: suspension, timers, sub-workflows,
//! scatter/gather fan-out, and loop control.

mod batch;
mod loop_ctrl;
mod sleep;
mod subflow;

use crate::execution::ExecutionContext;
use crate::registry::Builtin;
use craftcore::{AwaitingInfo, NodeContext, NodeDef, NodeResult, WorkflowError};

pub(crate) use subflow::extract_subflow_output;

pub async fn run(
    builtin: Builtin,
    ecx: &ExecutionContext,
    def: &NodeDef,
    nctx: &NodeContext,
) -> Result<NodeResult, WorkflowError> {
    match builtin {
        Builtin::Wait => run_wait(ecx, def).await,
        Builtin::Sleep => sleep::run(ecx, def, nctx).await,
        Builtin::Subflow => subflow::run(ecx, def, nctx).await,
        Builtin::BatchScatter => batch::run_scatter(ecx, def, nctx).await,
        Builtin::BatchGather => batch::run_gather(ecx, def, nctx).await,
        Builtin::LoopController => loop_ctrl::run(ecx, def, nctx).await,
    }
}

/// Suspends the workflow until an external signal resumes this node.
async fn run_wait(ecx: &ExecutionContext, def: &NodeDef) -> Result<NodeResult, WorkflowError> {
    let mut state = ecx.state.write().await;
    state
        .mark_awaiting(&def.id, AwaitingInfo::external_event())
        .await;
    Ok(NodeResult::empty())
}
