use craftcore::Blueprint;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Static facts about a blueprint: entry points, terminals, and cycles.
#[derive(Debug, Clone, Default)]
pub struct GraphAnalysis {
    pub start_node_ids: Vec<String>,
    pub terminal_node_ids: Vec<String>,
    pub cycles: Vec<Vec<String>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl GraphAnalysis {
    pub fn analyze(blueprint: &Blueprint) -> Self {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &blueprint.nodes {
            let idx = graph.add_node(node.id.clone());
            index_of.insert(node.id.as_str(), idx);
        }

        // Adjacency is kept separately in blueprint edge order: petgraph
        // iterates neighbors in reverse insertion order, and cycle reporting
        // must be deterministic.
        let mut adjacency: Vec<Vec<NodeIndex>> = vec![Vec::new(); graph.node_count()];
        for edge in &blueprint.edges {
            let (Some(&from), Some(&to)) = (
                index_of.get(edge.source.as_str()),
                index_of.get(edge.target.as_str()),
            ) else {
                continue;
            };
            graph.add_edge(from, to, ());
            adjacency[from.index()].push(to);
        }

        let start_node_ids = blueprint
            .nodes
            .iter()
            .filter(|n| {
                index_of
                    .get(n.id.as_str())
                    .map(|&idx| {
                        graph
                            .neighbors_directed(idx, Direction::Incoming)
                            .next()
                            .is_none()
                    })
                    .unwrap_or(false)
            })
            .map(|n| n.id.clone())
            .collect();

        let terminal_node_ids = blueprint
            .nodes
            .iter()
            .filter(|n| {
                index_of
                    .get(n.id.as_str())
                    .map(|&idx| {
                        graph
                            .neighbors_directed(idx, Direction::Outgoing)
                            .next()
                            .is_none()
                    })
                    .unwrap_or(false)
            })
            .map(|n| n.id.clone())
            .collect();

        let cycles = find_cycles(&graph, &adjacency);

        Self {
            start_node_ids,
            terminal_node_ids,
            cycles,
        }
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    /// Entry node for a cycle: the first configured entry point that lies on
    /// the cycle, otherwise the first node of the recorded cycle path.
    pub fn cycle_entry<'a>(cycle: &'a [String], configured: &'a [String]) -> Option<&'a str> {
        configured
            .iter()
            .find(|entry| cycle.contains(entry))
            .or_else(|| cycle.first())
            .map(String::as_str)
    }
}

/// Three-color DFS with an explicit stack. Each back edge yields a cycle
/// recorded as the path from the back-edge target to the current node,
/// followed by the back-edge target.
fn find_cycles(graph: &DiGraph<String, ()>, adjacency: &[Vec<NodeIndex>]) -> Vec<Vec<String>> {
    let mut colors = vec![Color::White; graph.node_count()];
    let mut cycles = Vec::new();

    for root in graph.node_indices() {
        if colors[root.index()] != Color::White {
            continue;
        }
        let mut path: Vec<NodeIndex> = vec![root];
        let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];
        colors[root.index()] = Color::Gray;

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            if frame.1 < adjacency[node.index()].len() {
                let next = adjacency[node.index()][frame.1];
                frame.1 += 1;
                match colors[next.index()] {
                    Color::White => {
                        colors[next.index()] = Color::Gray;
                        path.push(next);
                        stack.push((next, 0));
                    }
                    Color::Gray => {
                        let entry = path
                            .iter()
                            .position(|&p| p == next)
                            .expect("gray node must be on the current path");
                        let mut cycle: Vec<String> = path[entry..]
                            .iter()
                            .map(|&idx| graph[idx].clone())
                            .collect();
                        cycle.push(graph[next].clone());
                        cycles.push(cycle);
                    }
                    Color::Black => {}
                }
            } else {
                colors[node.index()] = Color::Black;
                stack.pop();
                path.pop();
            }
        }
    }

    cycles
}
