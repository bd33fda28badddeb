use crate::error::WorkflowError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Serializable declarative graph of nodes and edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Blueprint {
    pub id: String,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
    #[serde(default)]
    pub metadata: BlueprintMetadata,
}

impl Blueprint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn add_node(&mut self, node: NodeDef) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge(&mut self, edge: EdgeDef) -> &mut Self {
        self.edges.push(edge);
        self
    }

    /// Outgoing edges of `source`, in blueprint order.
    pub fn edges_from<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a EdgeDef> {
        self.edges.iter().filter(move |e| e.source == source)
    }

    /// Node ids that other nodes name as their `config.fallback`.
    pub fn fallback_targets(&self) -> HashSet<String> {
        self.nodes
            .iter()
            .filter_map(|n| n.config.as_ref().and_then(|c| c.fallback.clone()))
            .collect()
    }

    /// Structural sanitization: keep only allow-listed fields, drop nodes
    /// without a non-empty string id, and drop edges with missing endpoints.
    pub fn sanitize(raw: &Value) -> Result<Blueprint, WorkflowError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| WorkflowError::Configuration("blueprint must be an object".into()))?;
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                WorkflowError::Configuration("blueprint requires a non-empty string id".into())
            })?
            .to_string();

        let mut nodes = Vec::new();
        if let Some(raw_nodes) = obj.get("nodes").and_then(Value::as_array) {
            for raw_node in raw_nodes {
                if let Some(node) = sanitize_node(raw_node) {
                    nodes.push(node);
                }
            }
        }

        let mut edges = Vec::new();
        if let Some(raw_edges) = obj.get("edges").and_then(Value::as_array) {
            for raw_edge in raw_edges {
                if let Some(edge) = sanitize_edge(raw_edge) {
                    edges.push(edge);
                }
            }
        }

        let metadata = obj
            .get("metadata")
            .map(sanitize_metadata)
            .unwrap_or_default();

        Ok(Blueprint {
            id,
            nodes,
            edges,
            metadata,
        })
    }

    /// Re-applies sanitization to an already-typed blueprint.
    pub fn sanitized(&self) -> Result<Blueprint, WorkflowError> {
        let raw = serde_json::to_value(self)
            .map_err(|e| WorkflowError::Serialization(e.to_string()))?;
        Blueprint::sanitize(&raw)
    }

    /// Checks node id uniqueness and that edge endpoints exist.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(WorkflowError::Configuration(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(WorkflowError::Configuration(format!(
                        "edge references unknown node '{}'",
                        endpoint
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A unit of computation, selected from the registry via `uses`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDef {
    pub id: String,
    pub uses: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<NodeConfig>,
}

impl NodeDef {
    pub fn new(id: impl Into<String>, uses: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uses: uses.into(),
            params: None,
            inputs: None,
            config: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_inputs(mut self, inputs: InputSpec) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn join_strategy(&self) -> JoinStrategy {
        self.config
            .as_ref()
            .and_then(|c| c.join_strategy)
            .unwrap_or(JoinStrategy::All)
    }
}

/// Input binding: a single context key or a parameter-name -> key mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InputSpec {
    Key(String),
    Map(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Delay between retry attempts, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u64>,
    /// Bound on a single execution attempt, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_strategy: Option<JoinStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStrategy {
    All,
    Any,
}

/// Directed connection with optional action, condition and transform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeDef {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

impl EdgeDef {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            action: None,
            condition: None,
            transform: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cycle_entry_points: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn sanitize_node(raw: &Value) -> Option<NodeDef> {
    let obj = raw.as_object()?;
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();
    let uses = obj
        .get("uses")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = obj.get("params").cloned();
    let inputs = obj
        .get("inputs")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let config = obj.get("config").and_then(sanitize_config);
    Some(NodeDef {
        id,
        uses,
        params,
        inputs,
        config,
    })
}

fn sanitize_config(raw: &Value) -> Option<NodeConfig> {
    let obj = raw.as_object()?;
    let mut filtered = serde_json::Map::new();
    for key in ["maxRetries", "retryDelay", "timeout", "fallback", "joinStrategy"] {
        if let Some(value) = obj.get(key) {
            filtered.insert(key.to_string(), value.clone());
        }
    }
    serde_json::from_value(Value::Object(filtered)).ok()
}

fn sanitize_edge(raw: &Value) -> Option<EdgeDef> {
    let obj = raw.as_object()?;
    let source = obj
        .get("source")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();
    let target = obj
        .get("target")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();
    let field = |name: &str| {
        obj.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Some(EdgeDef {
        source,
        target,
        action: field("action"),
        condition: field("condition"),
        transform: field("transform"),
    })
}

fn sanitize_metadata(raw: &Value) -> BlueprintMetadata {
    let Some(obj) = raw.as_object() else {
        return BlueprintMetadata::default();
    };
    let cycle_entry_points = obj
        .get("cycleEntryPoints")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let extra = obj
        .iter()
        .filter(|(key, _)| {
            key.as_str() != "cycleEntryPoints" && !is_polluting_key(key)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    BlueprintMetadata {
        cycle_entry_points,
        extra,
    }
}

// Keys that collide with object internals in dynamic-language producers.
fn is_polluting_key(key: &str) -> bool {
    matches!(key, "__proto__" | "constructor" | "prototype")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_strips_unknown_fields_and_idless_nodes() {
        let raw = json!({
            "id": "bp",
            "nodes": [
                {"id": "a", "uses": "task", "secret": true, "config": {"maxRetries": 2, "bogus": 1}},
                {"uses": "orphan"},
                {"id": "", "uses": "empty"},
            ],
            "edges": [
                {"source": "a", "target": "b", "weight": 9},
                {"source": "a"},
            ],
            "metadata": {"cycleEntryPoints": ["a"], "__proto__": {"polluted": true}, "note": "ok"},
            "legacy": {"dropped": true},
        });
        let bp = Blueprint::sanitize(&raw).unwrap();
        assert_eq!(bp.nodes.len(), 1);
        assert_eq!(bp.nodes[0].id, "a");
        assert_eq!(bp.nodes[0].config.as_ref().unwrap().max_retries, Some(2));
        assert_eq!(bp.edges.len(), 1);
        assert_eq!(bp.metadata.cycle_entry_points, vec!["a".to_string()]);
        assert!(!bp.metadata.extra.contains_key("__proto__"));
        assert!(bp.metadata.extra.contains_key("note"));
    }

    #[test]
    fn sanitize_requires_blueprint_id() {
        assert!(Blueprint::sanitize(&json!({"nodes": []})).is_err());
        assert!(Blueprint::sanitize(&json!({"id": ""})).is_err());
    }

    #[test]
    fn input_spec_accepts_key_or_mapping() {
        let single: NodeDef =
            serde_json::from_value(json!({"id": "a", "uses": "t", "inputs": "data"})).unwrap();
        assert_eq!(single.inputs, Some(InputSpec::Key("data".into())));

        let mapped: NodeDef = serde_json::from_value(
            json!({"id": "a", "uses": "t", "inputs": {"left": "x", "right": "_raw"}}),
        )
        .unwrap();
        match mapped.inputs.unwrap() {
            InputSpec::Map(map) => {
                assert_eq!(map.get("left").unwrap(), "x");
                assert_eq!(map.get("right").unwrap(), "_raw");
            }
            other => panic!("expected mapping, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_duplicate_ids_and_dangling_edges() {
        let mut bp = Blueprint::new("bp");
        bp.add_node(NodeDef::new("a", "t"))
            .add_node(NodeDef::new("a", "t"));
        assert!(bp.validate().is_err());

        let mut bp = Blueprint::new("bp");
        bp.add_node(NodeDef::new("a", "t"))
            .add_edge(EdgeDef::new("a", "ghost"));
        assert!(bp.validate().is_err());
    }
}
