use crate::analysis::GraphAnalysis;
use crate::registry::{BATCH_GATHER_USES, LOOP_CONTROLLER_USES};
use craftcore::{input_key, Blueprint, EdgeDef, InputSpec, JoinStrategy, NodeDef, NodeResult};
use std::collections::{HashMap, HashSet};

/// Owns the dynamic blueprint copy, the predecessor map, the frontier, and
/// the completed set. Not safe for concurrent mutation; the orchestrator
/// serializes all calls between ticks.
pub struct GraphTraverser {
    blueprint: Blueprint,
    predecessors: HashMap<String, HashSet<String>>,
    frontier: Vec<String>,
    frontier_set: HashSet<String>,
    completed: HashSet<String>,
}

impl GraphTraverser {
    /// `completed` pre-seeds prior progress on resume; fresh runs pass an
    /// empty set.
    pub fn new(
        blueprint: Blueprint,
        analysis: &GraphAnalysis,
        strict: bool,
        completed: HashSet<String>,
    ) -> Self {
        let mut predecessors: HashMap<String, HashSet<String>> = HashMap::new();
        for edge in &blueprint.edges {
            predecessors
                .entry(edge.target.clone())
                .or_default()
                .insert(edge.source.clone());
        }

        let mut traverser = Self {
            blueprint,
            predecessors,
            frontier: Vec::new(),
            frontier_set: HashSet::new(),
            completed,
        };

        // Fallback nodes run on demand only; never seed them.
        let fallbacks = traverser.blueprint.fallback_targets();
        for id in &analysis.start_node_ids {
            if !fallbacks.contains(id) && !traverser.completed.contains(id) {
                traverser.add_to_frontier(id);
            }
        }

        // A blueprint that is all cycles has no start nodes; in non-strict
        // mode seed one representative per cycle.
        if traverser.frontier.is_empty()
            && !strict
            && analysis.has_cycles()
            && traverser.completed.is_empty()
        {
            let configured = traverser.blueprint.metadata.cycle_entry_points.clone();
            for cycle in &analysis.cycles {
                if let Some(entry) = GraphAnalysis::cycle_entry(cycle, &configured) {
                    traverser.add_to_frontier(&entry.to_string());
                }
            }
        }

        traverser
    }

    /// Immutable view of the dynamic blueprint.
    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.blueprint.node(id)
    }

    pub fn total_nodes(&self) -> usize {
        self.blueprint.nodes.len()
    }

    pub fn completed(&self) -> &HashSet<String> {
        &self.completed
    }

    pub fn remaining_nodes(&self) -> Vec<String> {
        self.blueprint
            .nodes
            .iter()
            .filter(|n| !self.completed.contains(&n.id))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn predecessor_count(&self, id: &str) -> usize {
        self.predecessors.get(id).map(HashSet::len).unwrap_or(0)
    }

    pub fn has_more_work(&self) -> bool {
        !self.frontier.is_empty()
    }

    /// Drains the frontier into `(id, def)` pairs for this tick.
    pub fn get_ready_nodes(&mut self) -> Vec<(String, NodeDef)> {
        let drained = std::mem::take(&mut self.frontier);
        self.frontier_set.clear();
        drained
            .into_iter()
            .filter_map(|id| self.blueprint.node(&id).cloned().map(|def| (id, def)))
            .collect()
    }

    pub fn add_to_frontier(&mut self, id: &str) {
        if self.frontier_set.insert(id.to_string()) {
            self.frontier.push(id.to_string());
        }
    }

    /// Records completion, splices the result's dynamic nodes, and schedules
    /// each matched successor whose effective join is satisfied.
    pub fn mark_node_completed(
        &mut self,
        node_id: &str,
        result: &NodeResult,
        matched_successors: &[String],
    ) {
        self.completed.insert(node_id.to_string());

        for dynamic in &result.dynamic_nodes {
            self.add_dynamic_node(
                dynamic.def.clone(),
                node_id,
                dynamic.gather.as_deref(),
            );
        }

        for successor in matched_successors {
            match self.effective_join(successor) {
                JoinStrategy::All => {
                    if !self.completed.contains(successor) && self.join_all_satisfied(successor) {
                        self.add_to_frontier(successor);
                    }
                }
                JoinStrategy::Any => {
                    // The just-completed predecessor is the trigger. Only
                    // loop-controller re-entry may re-activate a node that
                    // already completed.
                    if !self.completed.contains(successor) || self.loop_involved(successor) {
                        self.add_to_frontier(successor);
                    }
                }
            }
        }
    }

    /// Mark completion without any successor evaluation (fallback tracking).
    pub fn mark_completed(&mut self, node_id: &str) {
        self.completed.insert(node_id.to_string());
    }

    /// Splices a dynamic node into the private blueprint and the frontier.
    /// When a gather node is named, the new node becomes one of its
    /// predecessors and the gather is re-armed for the new wave.
    pub fn add_dynamic_node(&mut self, def: NodeDef, producer: &str, gather: Option<&str>) {
        let id = def.id.clone();
        if self.blueprint.node(&id).is_some() {
            return;
        }
        self.blueprint.nodes.push(def);
        self.predecessors
            .entry(id.clone())
            .or_default()
            .insert(producer.to_string());
        if let Some(gather_id) = gather {
            self.blueprint
                .edges
                .push(EdgeDef::new(id.clone(), gather_id));
            self.predecessors
                .entry(gather_id.to_string())
                .or_default()
                .insert(id.clone());
            self.completed.remove(gather_id);
        }
        self.add_to_frontier(&id);
    }

    /// Binds a target without explicit inputs to its staged `_inputs` slot.
    pub fn set_default_input(&mut self, target: &str) {
        let staged = input_key(target);
        if let Some(node) = self.blueprint.nodes.iter_mut().find(|n| n.id == target) {
            if node.inputs.is_none() {
                node.inputs = Some(InputSpec::Key(staged));
            }
        }
    }

    /// Whether `target`'s inputs were declared by the blueprint author, as
    /// opposed to the staged slot this traverser assigned.
    pub fn has_explicit_inputs(&self, target: &str) -> bool {
        match self.blueprint.node(target).and_then(|n| n.inputs.as_ref()) {
            Some(InputSpec::Key(key)) => *key != input_key(target),
            Some(InputSpec::Map(_)) => true,
            None => false,
        }
    }

    fn is_loop_controller(&self, id: &str) -> bool {
        self.blueprint
            .node(id)
            .map(|n| n.uses == LOOP_CONTROLLER_USES)
            .unwrap_or(false)
    }

    /// Loop controllers and their direct successors re-enter across
    /// iterations without waiting for prior predecessors to re-complete.
    fn loop_involved(&self, id: &str) -> bool {
        self.is_loop_controller(id)
            || self
                .predecessors
                .get(id)
                .map(|preds| preds.iter().any(|p| self.is_loop_controller(p)))
                .unwrap_or(false)
    }

    fn effective_join(&self, id: &str) -> JoinStrategy {
        if self.loop_involved(id) {
            return JoinStrategy::Any;
        }
        let Some(node) = self.blueprint.node(id) else {
            return JoinStrategy::All;
        };
        if node.uses == BATCH_GATHER_USES {
            return JoinStrategy::All;
        }
        node.join_strategy()
    }

    fn join_all_satisfied(&self, id: &str) -> bool {
        self.predecessors
            .get(id)
            .map(|preds| preds.iter().all(|p| self.completed.contains(p)))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craftcore::{DynamicNode, NodeConfig};
    use serde_json::json;

    fn diamond() -> Blueprint {
        let mut bp = Blueprint::new("bp");
        for id in ["a", "b", "c", "d"] {
            bp.add_node(NodeDef::new(id, "task"));
        }
        for source in ["a", "b", "c"] {
            bp.add_edge(EdgeDef::new(source, "d"));
        }
        bp
    }

    fn traverser(bp: Blueprint) -> GraphTraverser {
        let analysis = GraphAnalysis::analyze(&bp);
        GraphTraverser::new(bp, &analysis, false, HashSet::new())
    }

    fn ready_ids(t: &mut GraphTraverser) -> Vec<String> {
        t.get_ready_nodes().into_iter().map(|(id, _)| id).collect()
    }

    #[test]
    fn all_join_waits_for_every_predecessor() {
        let mut t = traverser(diamond());
        assert_eq!(ready_ids(&mut t), vec!["a", "b", "c"]);

        let result = NodeResult::empty();
        t.mark_node_completed("a", &result, &["d".to_string()]);
        assert!(!t.has_more_work());
        t.mark_node_completed("b", &result, &["d".to_string()]);
        assert!(!t.has_more_work());
        t.mark_node_completed("c", &result, &["d".to_string()]);
        assert_eq!(ready_ids(&mut t), vec!["d"]);

        // Never re-added under all once completed.
        t.mark_node_completed("d", &result, &[]);
        t.mark_node_completed("a", &result, &["d".to_string()]);
        assert!(!t.has_more_work());
    }

    #[test]
    fn any_join_triggers_on_first_completion_only() {
        let mut bp = diamond();
        bp.nodes[3].config = Some(NodeConfig {
            join_strategy: Some(JoinStrategy::Any),
            ..Default::default()
        });
        let mut t = traverser(bp);
        ready_ids(&mut t);

        let result = NodeResult::empty();
        t.mark_node_completed("a", &result, &["d".to_string()]);
        assert_eq!(ready_ids(&mut t), vec!["d"]);

        t.mark_node_completed("d", &result, &[]);
        t.mark_node_completed("b", &result, &["d".to_string()]);
        assert!(!t.has_more_work(), "completed any-join must not re-trigger");
    }

    #[test]
    fn loop_controller_successor_re_enters() {
        let mut bp = Blueprint::new("loop");
        bp.add_node(NodeDef::new("ctl", "loop-controller"))
            .add_node(NodeDef::new("body", "task"))
            .add_edge(EdgeDef::new("ctl", "body").with_action("continue"))
            .add_edge(EdgeDef::new("body", "ctl"));
        let mut t = traverser(bp);
        ready_ids(&mut t);

        let result = NodeResult::empty();
        t.mark_node_completed("ctl", &result, &["body".to_string()]);
        assert_eq!(ready_ids(&mut t), vec!["body"]);
        t.mark_node_completed("body", &result, &["ctl".to_string()]);
        assert_eq!(ready_ids(&mut t), vec!["ctl"]);
        // Second iteration re-activates the completed body.
        t.mark_node_completed("ctl", &result, &["body".to_string()]);
        assert_eq!(ready_ids(&mut t), vec!["body"]);
    }

    #[test]
    fn fallback_nodes_are_not_seeded() {
        let mut bp = Blueprint::new("bp");
        bp.add_node(NodeDef::new("main", "task").with_config(NodeConfig {
            fallback: Some("backup".into()),
            ..Default::default()
        }))
        .add_node(NodeDef::new("backup", "task"));
        let mut t = traverser(bp);
        assert_eq!(ready_ids(&mut t), vec!["main"]);
    }

    #[test]
    fn cycle_entry_seeding_when_no_start_nodes() {
        let mut bp = Blueprint::new("cyclic");
        bp.add_node(NodeDef::new("x", "task"))
            .add_node(NodeDef::new("y", "task"))
            .add_edge(EdgeDef::new("x", "y"))
            .add_edge(EdgeDef::new("y", "x"));
        bp.metadata.cycle_entry_points = vec!["y".into()];
        let mut t = traverser(bp);
        assert_eq!(ready_ids(&mut t), vec!["y"]);
    }

    #[test]
    fn dynamic_workers_gate_their_gather() {
        let mut bp = Blueprint::new("batch");
        bp.add_node(NodeDef::new("scatter", "task"))
            .add_node(NodeDef::new("gather", "task"))
            .add_edge(EdgeDef::new("scatter", "gather"));
        let mut t = traverser(bp);
        ready_ids(&mut t);

        let mut result = NodeResult::with_output(json!(null));
        for i in 0..3 {
            result.dynamic_nodes.push(DynamicNode {
                def: NodeDef::new(format!("worker_{i}"), "task"),
                gather: Some("gather".into()),
            });
        }
        t.mark_node_completed("scatter", &result, &["gather".to_string()]);
        assert_eq!(t.predecessor_count("gather"), 4);
        // Workers become ready; the gather still waits for all of them.
        assert_eq!(ready_ids(&mut t), vec!["worker_0", "worker_1", "worker_2"]);

        let done = NodeResult::empty();
        t.mark_node_completed("worker_0", &done, &["gather".to_string()]);
        t.mark_node_completed("worker_1", &done, &["gather".to_string()]);
        assert!(!t.has_more_work());
        t.mark_node_completed("worker_2", &done, &["gather".to_string()]);
        assert_eq!(ready_ids(&mut t), vec!["gather"]);
    }

    #[test]
    fn explicit_inputs_detection_ignores_staged_slot() {
        let mut bp = Blueprint::new("bp");
        bp.add_node(NodeDef::new("a", "task"))
            .add_node(NodeDef::new("b", "task"))
            .add_edge(EdgeDef::new("a", "b"));
        let mut t = traverser(bp);
        assert!(!t.has_explicit_inputs("b"));
        t.set_default_input("b");
        assert!(!t.has_explicit_inputs("b"));
        assert_eq!(
            t.node("b").unwrap().inputs,
            Some(InputSpec::Key("_inputs.b".into()))
        );
    }
}
