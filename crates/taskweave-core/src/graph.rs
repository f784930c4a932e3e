use std::collections::{HashMap, HashSet, VecDeque};

use crate::template::{EdgeTemplate, NodeTemplate};

/// Adjacency view over a template's nodes and edges.
///
/// Keys are template-local node keys. Lists keep edge declaration order so
/// traversal output is stable.
#[derive(Debug, Clone)]
pub struct Graph {
    order: Vec<String>,
    downstream: HashMap<String, Vec<String>>,
    upstream: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn new(nodes: &[NodeTemplate], edges: &[EdgeTemplate]) -> Self {
        let mut downstream: HashMap<String, Vec<String>> = HashMap::new();
        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();

        for node in nodes {
            downstream.entry(node.key.clone()).or_default();
            upstream.entry(node.key.clone()).or_default();
        }

        for edge in edges {
            downstream
                .entry(edge.from.clone())
                .or_default()
                .push(edge.to.clone());
            upstream
                .entry(edge.to.clone())
                .or_default()
                .push(edge.from.clone());
        }

        Self {
            order: nodes.iter().map(|n| n.key.clone()).collect(),
            downstream,
            upstream,
        }
    }

    /// Immediate successors of a node.
    pub fn downstream(&self, key: &str) -> &[String] {
        self.downstream.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Immediate predecessors of a node.
    pub fn upstream(&self, key: &str) -> &[String] {
        self.upstream.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Nodes with no incoming edges, in declaration order.
    pub fn entry_points(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|k| self.upstream(k).is_empty())
            .cloned()
            .collect()
    }

    /// Nodes with no outgoing edges, in declaration order.
    pub fn exit_points(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|k| self.downstream(k).is_empty())
            .cloned()
            .collect()
    }

    /// Whether a node waits on more than one predecessor.
    pub fn is_join_point(&self, key: &str) -> bool {
        self.upstream(key).len() > 1
    }

    /// Topological order (Kahn). Returns `None` if the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|k| (k.as_str(), self.upstream(k).len()))
            .collect();
        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .filter(|k| in_degree[k.as_str()] == 0)
            .map(|k| k.as_str())
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(key) = queue.pop_front() {
            sorted.push(key.to_string());
            for next in self.downstream(key) {
                if let Some(deg) = in_degree.get_mut(next.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(next.as_str());
                    }
                }
            }
        }

        (sorted.len() == self.order.len()).then_some(sorted)
    }

    /// Weakly connected components, each listed in declaration order.
    pub fn components(&self) -> Vec<Vec<String>> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut components = Vec::new();

        for start in &self.order {
            if !seen.insert(start.as_str()) {
                continue;
            }
            let mut members: HashSet<&str> = HashSet::from([start.as_str()]);
            let mut stack = vec![start.as_str()];
            while let Some(key) = stack.pop() {
                for next in self.downstream(key).iter().chain(self.upstream(key)) {
                    if seen.insert(next.as_str()) {
                        members.insert(next.as_str());
                        stack.push(next.as_str());
                    }
                }
            }
            components.push(
                self.order
                    .iter()
                    .filter(|k| members.contains(k.as_str()))
                    .cloned()
                    .collect(),
            );
        }

        components
    }
}
