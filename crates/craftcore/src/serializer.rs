use crate::error::WorkflowError;
use serde_json::Value;

/// Context serialization for result payloads and resumption.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<String, WorkflowError>;
    fn deserialize(&self, text: &str) -> Result<Value, WorkflowError>;
}

/// Default serializer. Values that have no JSON representation are not
/// preserved; users storing such values must supply their own serializer.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<String, WorkflowError> {
        serde_json::to_string(value).map_err(|e| WorkflowError::Serialization(e.to_string()))
    }

    fn deserialize(&self, text: &str) -> Result<Value, WorkflowError> {
        serde_json::from_str(text).map_err(|e| WorkflowError::Serialization(e.to_string()))
    }
}
