use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    #[error("workflow cancelled")]
    Cancelled { node_id: Option<String> },

    #[error("node '{node_id}' failed: {message}")]
    NodeExecution {
        node_id: String,
        message: String,
        fatal: bool,
        #[source]
        cause: Option<Box<WorkflowError>>,
    },

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("blueprint contains cycles")]
    Cycle(Vec<Vec<String>>),

    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl WorkflowError {
    pub fn cancelled() -> Self {
        WorkflowError::Cancelled { node_id: None }
    }

    pub fn cancelled_at(node_id: impl Into<String>) -> Self {
        WorkflowError::Cancelled {
            node_id: Some(node_id.into()),
        }
    }

    /// Retriable node failure.
    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::NodeExecution {
            node_id: node_id.into(),
            message: message.into(),
            fatal: false,
            cause: None,
        }
    }

    /// Node failure that disables retries and fallbacks.
    pub fn fatal_node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::NodeExecution {
            node_id: node_id.into(),
            message: message.into(),
            fatal: true,
            cause: None,
        }
    }

    pub fn with_cause(self, cause: WorkflowError) -> Self {
        match self {
            WorkflowError::NodeExecution {
                node_id,
                message,
                fatal,
                ..
            } => WorkflowError::NodeExecution {
                node_id,
                message,
                fatal,
                cause: Some(Box::new(cause)),
            },
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled { .. })
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            WorkflowError::Fatal(_) | WorkflowError::Configuration(_) | WorkflowError::Cycle(_) => {
                true
            }
            WorkflowError::NodeExecution { fatal, .. } => *fatal,
            _ => false,
        }
    }

    /// Stable identifier used in error records and event payloads.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowError::Cancelled { .. } => "WorkflowCancelled",
            WorkflowError::NodeExecution { .. } => "NodeExecutionError",
            WorkflowError::Fatal(_) => "FatalError",
            WorkflowError::Configuration(_) => "ConfigurationError",
            WorkflowError::Cycle(_) => "CycleError",
            WorkflowError::Timeout { .. } => "TimeoutError",
            WorkflowError::Execution(_) => "ExecutionError",
            WorkflowError::Serialization(_) => "SerializationError",
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            WorkflowError::Cancelled { node_id } => node_id.as_deref(),
            WorkflowError::NodeExecution { node_id, .. } => Some(node_id),
            WorkflowError::Timeout { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Serializable snapshot of a [`WorkflowError`] for result payloads and logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub is_fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(error: &WorkflowError) -> Self {
        let cause = match error {
            WorkflowError::NodeExecution {
                cause: Some(cause), ..
            } => Some(cause.to_string()),
            _ => None,
        };
        Self {
            name: error.name().to_string(),
            message: error.to_string(),
            node_id: error.node_id().map(str::to_string),
            blueprint_id: None,
            execution_id: None,
            is_fatal: error.is_fatal(),
            cause,
            timestamp: Utc::now(),
        }
    }

    pub fn with_blueprint(mut self, blueprint_id: impl Into<String>) -> Self {
        self.blueprint_id = Some(blueprint_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}
