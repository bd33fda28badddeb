//! Core abstractions for the Flowcraft workflow engine
//!
//! This crate provides the fundamental types every other component depends
//! on: the blueprint model and sanitizer, the keyed context with its async
//! view, workflow state and results, node contracts, the error taxonomy,
//! the execution event stream, and the serializer seam.

mod blueprint;
mod context;
mod error;
mod events;
mod node;
mod serializer;
mod state;

pub use blueprint::{
    Blueprint, BlueprintMetadata, EdgeDef, InputSpec, JoinStrategy, NodeConfig, NodeDef,
};
pub use context::{AsyncContextView, Context, ContextOp, ContextPatch};
pub use error::{ErrorRecord, WorkflowError};
pub use events::{
    BroadcastEventBus, CollectingEventBus, EventBus, FlowcraftEvent, NullEventBus, TeeEventBus,
};
pub use node::{
    handler_fn, Dependencies, DynamicNode, FnNode, LifecycleFactory, LifecycleNode, NodeContext,
    NodeHandler, NodeResult,
};
pub use serializer::{JsonSerializer, Serializer};
pub use state::{
    input_key, output_key, AwaitReason, AwaitingInfo, WorkflowResult, WorkflowState,
    WorkflowStatus, AWAITING_DETAILS_PREFIX, AWAITING_IDS_KEY, BATCH_PREFIX, EXECUTION_ID_KEY,
    INPUTS_PREFIX, OUTPUTS_PREFIX, SUBFLOW_STATE_PREFIX,
};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;
