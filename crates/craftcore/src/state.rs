use crate::context::{AsyncContextView, Context};
use crate::error::ErrorRecord;
use crate::serializer::Serializer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Reserved context key namespaces.
pub const OUTPUTS_PREFIX: &str = "_outputs.";
pub const INPUTS_PREFIX: &str = "_inputs.";
pub const BATCH_PREFIX: &str = "_batch.";
pub const EXECUTION_ID_KEY: &str = "_executionId";
pub const AWAITING_IDS_KEY: &str = "_awaitingNodeIds";
pub const AWAITING_DETAILS_PREFIX: &str = "_awaitingDetails.";
pub const SUBFLOW_STATE_PREFIX: &str = "_subflowState.";

pub fn output_key(node_id: &str) -> String {
    format!("{OUTPUTS_PREFIX}{node_id}")
}

pub fn input_key(node_id: &str) -> String {
    format!("{INPUTS_PREFIX}{node_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Stalled,
    Cancelled,
    Awaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitReason {
    ExternalEvent,
    Timer,
    Subflow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwaitingInfo {
    pub reason: AwaitReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_up_at: Option<DateTime<Utc>>,
}

impl AwaitingInfo {
    pub fn external_event() -> Self {
        Self {
            reason: AwaitReason::ExternalEvent,
            wake_up_at: None,
        }
    }

    pub fn timer(wake_up_at: DateTime<Utc>) -> Self {
        Self {
            reason: AwaitReason::Timer,
            wake_up_at: Some(wake_up_at),
        }
    }

    pub fn subflow() -> Self {
        Self {
            reason: AwaitReason::Subflow,
            wake_up_at: None,
        }
    }
}

/// Final payload of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub context: Value,
    pub serialized_context: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
}

/// Mutable per-run state: completed set, errors, awaiting set, and the
/// shared context. Mutated by the executor/orchestrator only.
pub struct WorkflowState {
    context: Arc<RwLock<Context>>,
    completed: HashSet<String>,
    errors: Vec<ErrorRecord>,
    any_fallback_executed: bool,
    // Insertion-ordered so "first awaiting node" is well defined.
    awaiting: Vec<(String, AwaitingInfo)>,
}

impl WorkflowState {
    pub fn new(context: Context) -> Self {
        Self {
            context: Arc::new(RwLock::new(context)),
            completed: HashSet::new(),
            errors: Vec::new(),
            any_fallback_executed: false,
            awaiting: Vec::new(),
        }
    }

    /// Rebuilds state from a serialized context: the completed set from
    /// `_outputs.*` keys, the awaiting set from `_awaitingNodeIds` and
    /// `_awaitingDetails.*`.
    pub fn from_serialized(
        text: &str,
        serializer: &dyn Serializer,
    ) -> Result<Self, crate::error::WorkflowError> {
        let json = serializer.deserialize(text)?;
        let context = Context::from_json(&json);

        let completed = context
            .keys()
            .filter_map(|k| k.strip_prefix(OUTPUTS_PREFIX))
            .map(str::to_string)
            .collect();

        let mut awaiting = Vec::new();
        if let Some(ids) = context.get(AWAITING_IDS_KEY).and_then(Value::as_array) {
            for id in ids.iter().filter_map(Value::as_str) {
                let info = context
                    .get(&format!("{AWAITING_DETAILS_PREFIX}{id}"))
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_else(AwaitingInfo::external_event);
                awaiting.push((id.to_string(), info));
            }
        }

        Ok(Self {
            context: Arc::new(RwLock::new(context)),
            completed,
            errors: Vec::new(),
            any_fallback_executed: false,
            awaiting,
        })
    }

    pub fn context_handle(&self) -> Arc<RwLock<Context>> {
        self.context.clone()
    }

    /// Connects the context to an event bus, e.g. after deserialization.
    pub async fn bind_bus(
        &self,
        bus: Arc<dyn crate::events::EventBus>,
        execution_id: impl Into<String>,
    ) {
        self.context.write().await.bind_bus(bus, execution_id);
    }

    pub fn view(&self) -> AsyncContextView {
        AsyncContextView::new(self.context.clone())
    }

    pub fn scoped_view(&self, node_id: &str) -> AsyncContextView {
        AsyncContextView::scoped(self.context.clone(), node_id)
    }

    pub fn completed(&self) -> &HashSet<String> {
        &self.completed
    }

    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed.contains(node_id)
    }

    /// Records completion and publishes the node's output.
    pub async fn record_completion(&mut self, node_id: &str, output: Option<Value>) {
        self.completed.insert(node_id.to_string());
        self.context.write().await.set_from(
            Some(node_id),
            output_key(node_id),
            output.unwrap_or(Value::Null),
        );
    }

    /// Completed-set membership only; no output is published.
    pub fn mark_completed(&mut self, node_id: &str) {
        self.completed.insert(node_id.to_string());
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn record_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    pub fn any_fallback_executed(&self) -> bool {
        self.any_fallback_executed
    }

    pub fn set_fallback_executed(&mut self) {
        self.any_fallback_executed = true;
    }

    pub fn is_awaiting(&self) -> bool {
        !self.awaiting.is_empty()
    }

    pub fn awaiting(&self) -> &[(String, AwaitingInfo)] {
        &self.awaiting
    }

    pub fn awaiting_info(&self, node_id: &str) -> Option<&AwaitingInfo> {
        self.awaiting
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(_, info)| info)
    }

    pub fn first_awaiting(&self) -> Option<&str> {
        self.awaiting.first().map(|(id, _)| id.as_str())
    }

    pub async fn mark_awaiting(&mut self, node_id: &str, info: AwaitingInfo) {
        if self.awaiting.iter().any(|(id, _)| id == node_id) {
            return;
        }
        self.awaiting.push((node_id.to_string(), info.clone()));
        let detail = serde_json::to_value(&info).unwrap_or(Value::Null);
        let ids = self.awaiting_ids_json();
        let mut ctx = self.context.write().await;
        ctx.set_from(Some(node_id), format!("{AWAITING_DETAILS_PREFIX}{node_id}"), detail);
        ctx.set_from(Some(node_id), AWAITING_IDS_KEY, ids);
    }

    pub async fn clear_awaiting(&mut self, node_id: &str) {
        let before = self.awaiting.len();
        self.awaiting.retain(|(id, _)| id != node_id);
        if self.awaiting.len() == before {
            return;
        }
        let ids = self.awaiting_ids_json();
        let mut ctx = self.context.write().await;
        ctx.delete_from(Some(node_id), &format!("{AWAITING_DETAILS_PREFIX}{node_id}"));
        if self.awaiting.is_empty() {
            ctx.delete_from(Some(node_id), AWAITING_IDS_KEY);
        } else {
            ctx.set_from(Some(node_id), AWAITING_IDS_KEY, ids);
        }
    }

    fn awaiting_ids_json(&self) -> Value {
        Value::Array(
            self.awaiting
                .iter()
                .map(|(id, _)| Value::String(id.clone()))
                .collect(),
        )
    }

    /// Overall status at the end of a run.
    pub fn derive_status(&self, traversal_complete: bool, total_nodes: usize) -> WorkflowStatus {
        if self.is_awaiting() {
            WorkflowStatus::Awaiting
        } else if self.any_fallback_executed && self.errors.is_empty() {
            WorkflowStatus::Completed
        } else if !self.errors.is_empty() {
            WorkflowStatus::Failed
        } else if self.completed.len() < total_nodes && traversal_complete {
            WorkflowStatus::Stalled
        } else {
            WorkflowStatus::Completed
        }
    }

    /// Serializes the context into a result payload, stamping the run id.
    pub async fn build_result(
        &self,
        status: WorkflowStatus,
        serializer: &dyn Serializer,
        execution_id: &str,
    ) -> Result<WorkflowResult, crate::error::WorkflowError> {
        let json = {
            let mut ctx = self.context.write().await;
            ctx.set(EXECUTION_ID_KEY, Value::String(execution_id.to_string()));
            ctx.to_json()
        };
        let serialized_context = serializer.serialize(&json)?;
        Ok(WorkflowResult {
            context: json,
            serialized_context,
            status,
            errors: self.errors.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorRecord, WorkflowError};
    use crate::serializer::JsonSerializer;
    use serde_json::json;

    #[tokio::test]
    async fn status_derivation_covers_all_branches() {
        let mut state = WorkflowState::new(Context::new());
        assert_eq!(state.derive_status(true, 0), WorkflowStatus::Completed);

        // Incomplete traversal with no frontier left.
        assert_eq!(state.derive_status(true, 2), WorkflowStatus::Stalled);

        state.record_completion("a", Some(json!(1))).await;
        state.record_completion("b", None).await;
        assert_eq!(state.derive_status(true, 2), WorkflowStatus::Completed);

        state.record_error(ErrorRecord::from_error(&WorkflowError::node("b", "boom")));
        assert_eq!(state.derive_status(true, 2), WorkflowStatus::Failed);

        state.mark_awaiting("w", AwaitingInfo::external_event()).await;
        assert_eq!(state.derive_status(false, 2), WorkflowStatus::Awaiting);
    }

    #[tokio::test]
    async fn fallback_without_errors_completes() {
        let mut state = WorkflowState::new(Context::new());
        state.record_completion("a", Some(json!("x"))).await;
        state.set_fallback_executed();
        assert_eq!(state.derive_status(true, 2), WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn awaiting_round_trips_through_serialization() {
        let serializer = JsonSerializer;
        let mut state = WorkflowState::new(Context::new());
        state.record_completion("a", Some(json!("out"))).await;
        state
            .mark_awaiting(
                "sleeper",
                AwaitingInfo::timer(Utc::now() + chrono::Duration::seconds(5)),
            )
            .await;
        state.mark_awaiting("waiter", AwaitingInfo::external_event()).await;

        let result = state
            .build_result(WorkflowStatus::Awaiting, &serializer, "exec-1")
            .await
            .unwrap();
        let restored = WorkflowState::from_serialized(&result.serialized_context, &serializer)
            .unwrap();

        assert!(restored.is_completed("a"));
        assert_eq!(restored.first_awaiting(), Some("sleeper"));
        assert_eq!(
            restored.awaiting_info("sleeper").unwrap().reason,
            AwaitReason::Timer
        );
        assert!(restored.awaiting_info("sleeper").unwrap().wake_up_at.is_some());
        assert_eq!(
            restored.awaiting_info("waiter").unwrap().reason,
            AwaitReason::ExternalEvent
        );
    }

    #[tokio::test]
    async fn clear_awaiting_updates_reserved_keys() {
        let mut state = WorkflowState::new(Context::new());
        state.mark_awaiting("a", AwaitingInfo::external_event()).await;
        state.mark_awaiting("b", AwaitingInfo::external_event()).await;
        state.clear_awaiting("a").await;

        let view = state.view();
        assert_eq!(view.get(AWAITING_IDS_KEY).await, Some(json!(["b"])));
        assert!(!view.has("_awaitingDetails.a").await);
        state.clear_awaiting("b").await;
        assert!(!view.has(AWAITING_IDS_KEY).await);
    }
}
