use craftcore::{
    AwaitingInfo, Context, FlowcraftEvent, Serializer, WorkflowError, WorkflowResult,
    WorkflowState, WorkflowStatus, AWAITING_DETAILS_PREFIX,
};
use std::collections::HashMap;

/// Event-sourced state reconstruction: rebuilds the final context and
/// completion bookkeeping from a recorded stream without running any user
/// code. Unknown event variants are ignored by construction.
pub struct ReplayOrchestrator {
    execution_id: String,
}

impl ReplayOrchestrator {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }

    pub async fn replay(
        &self,
        events: &[FlowcraftEvent],
        serializer: &dyn Serializer,
    ) -> Result<WorkflowResult, WorkflowError> {
        let mut state = WorkflowState::new(Context::new());
        // fallback node id -> original node id, learned from node:fallback.
        let mut fallback_origin: HashMap<String, String> = HashMap::new();

        for event in events
            .iter()
            .filter(|e| e.execution_id() == Some(self.execution_id.as_str()))
        {
            match event {
                FlowcraftEvent::NodeFinish {
                    node_id, result, ..
                } => {
                    state
                        .record_completion(node_id, result.output.clone())
                        .await;
                    if let Some(original) = fallback_origin.get(node_id).cloned() {
                        state
                            .record_completion(&original, result.output.clone())
                            .await;
                    }
                }
                FlowcraftEvent::ContextChange { key, op, value, .. } => {
                    let handle = state.context_handle();
                    handle.write().await.apply_silent(*op, key, value.clone());
                }
                FlowcraftEvent::NodeError { error, .. } => {
                    state.record_error(error.clone());
                }
                FlowcraftEvent::NodeFallback {
                    node_id, fallback, ..
                } => {
                    fallback_origin.insert(fallback.clone(), node_id.clone());
                    state.set_fallback_executed();
                }
                FlowcraftEvent::WorkflowStall { .. } => {}
                FlowcraftEvent::WorkflowPause {
                    awaiting_node_ids, ..
                } => {
                    for node_id in awaiting_node_ids {
                        let info = {
                            let handle = state.context_handle();
                            let guard = handle.read().await;
                            guard
                                .get(&format!("{AWAITING_DETAILS_PREFIX}{node_id}"))
                                .and_then(|v| {
                                    serde_json::from_value::<AwaitingInfo>(v.clone()).ok()
                                })
                                .unwrap_or_else(AwaitingInfo::external_event)
                        };
                        state.mark_awaiting(node_id, info).await;
                    }
                }
                _ => {}
            }
        }

        // Replay always reconstructs final state.
        state
            .build_result(WorkflowStatus::Completed, serializer, &self.execution_id)
            .await
    }
}