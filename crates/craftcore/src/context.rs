use crate::events::{EventBus, FlowcraftEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Mutation kind carried by `context:change` events and patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextOp {
    Set,
    Delete,
}

/// One entry of an atomic context patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ContextPatch {
    Set { key: String, value: Value },
    Delete { key: String },
}

/// Keyed store of arbitrary serializable values.
///
/// Every mutation is reported through the bound event bus so a persisted
/// event stream can rebuild the store deterministically.
#[derive(Default)]
pub struct Context {
    entries: BTreeMap<String, Value>,
    bus: Option<Arc<dyn EventBus>>,
    execution_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(entries: BTreeMap<String, Value>) -> Self {
        Self {
            entries,
            bus: None,
            execution_id: None,
        }
    }

    /// Builds a context from a serialized JSON object.
    pub fn from_json(value: &Value) -> Self {
        let entries = value
            .as_object()
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self::from_values(entries)
    }

    pub fn bind_bus(&mut self, bus: Arc<dyn EventBus>, execution_id: impl Into<String>) {
        self.bus = Some(bus);
        self.execution_id = Some(execution_id.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.set_from(None, key, value);
    }

    pub fn set_from(&mut self, source: Option<&str>, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.entries.insert(key.clone(), value.clone());
        self.emit_change(source, key, ContextOp::Set, Some(value));
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.delete_from(None, key)
    }

    pub fn delete_from(&mut self, source: Option<&str>, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.emit_change(source, key.to_string(), ContextOp::Delete, None);
        }
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Applies a change op without re-emitting it. Used by replay.
    pub fn apply_silent(&mut self, op: ContextOp, key: &str, value: Option<Value>) {
        match op {
            ContextOp::Set => {
                self.entries
                    .insert(key.to_string(), value.unwrap_or(Value::Null));
            }
            ContextOp::Delete => {
                self.entries.remove(key);
            }
        }
    }

    fn emit_change(&self, source: Option<&str>, key: String, op: ContextOp, value: Option<Value>) {
        if let Some(bus) = &self.bus {
            bus.emit(FlowcraftEvent::ContextChange {
                execution_id: self.execution_id.clone(),
                source_node: source.map(str::to_string),
                key,
                op,
                value,
            });
        }
    }
}

/// Asynchronous projection of a [`Context`], the view every node sees.
///
/// The in-memory implementation resolves immediately; a distributed backend
/// can implement the same surface over a network store.
#[derive(Clone)]
pub struct AsyncContextView {
    inner: Arc<RwLock<Context>>,
    source: Option<String>,
}

impl AsyncContextView {
    pub fn new(inner: Arc<RwLock<Context>>) -> Self {
        Self {
            inner,
            source: None,
        }
    }

    /// A view whose writes are attributed to `node_id` in change events.
    pub fn scoped(inner: Arc<RwLock<Context>>, node_id: impl Into<String>) -> Self {
        Self {
            inner,
            source: Some(node_id.into()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn has(&self, key: &str) -> bool {
        self.inner.read().await.has(key)
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.inner
            .write()
            .await
            .set_from(self.source.as_deref(), key, value);
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner
            .write()
            .await
            .delete_from(self.source.as_deref(), key)
    }

    pub async fn to_json(&self) -> Value {
        self.inner.read().await.to_json()
    }

    /// Applies all ops under a single write lock.
    pub async fn patch(&self, ops: Vec<ContextPatch>) {
        let mut guard = self.inner.write().await;
        for op in ops {
            match op {
                ContextPatch::Set { key, value } => {
                    guard.set_from(self.source.as_deref(), key, value)
                }
                ContextPatch::Delete { key } => {
                    guard.delete_from(self.source.as_deref(), &key);
                }
            }
        }
    }
}
