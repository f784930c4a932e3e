//! Pure graph rewrite shared by merge preview and merge execution.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use taskweave_core::error::{Result, TaskweaveError};
use taskweave_core::template::{EdgeTemplate, NodeTemplate, WorkflowDesign, WorkflowTemplate};
use taskweave_core::types::SubdivisionId;

/// Single entry and exit of a sub-workflow once placeholders are removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildShape {
    pub entry: String,
    pub exit: String,
}

/// Check that a child template can stand in for a single node.
///
/// Start/end placeholders are dropped first; what remains must have
/// exactly one node without incoming edges and one without outgoing edges,
/// and no edge may reference a node that does not exist.
pub fn child_shape(child: &WorkflowTemplate) -> std::result::Result<ChildShape, String> {
    let keys: HashSet<&str> = child.nodes.iter().map(|n| n.key.as_str()).collect();
    for edge in &child.edges {
        for end in [&edge.from, &edge.to] {
            if !keys.contains(end.as_str()) {
                return Err(format!(
                    "edge {} -> {} references missing node '{}'",
                    edge.from, edge.to, end
                ));
            }
        }
    }

    let core: Vec<&NodeTemplate> = child
        .nodes
        .iter()
        .filter(|n| !n.kind.is_placeholder())
        .collect();
    if core.is_empty() {
        return Err("sub-workflow has no work nodes".into());
    }
    let core_keys: HashSet<&str> = core.iter().map(|n| n.key.as_str()).collect();
    let core_edges: Vec<&EdgeTemplate> = child
        .edges
        .iter()
        .filter(|e| core_keys.contains(e.from.as_str()) && core_keys.contains(e.to.as_str()))
        .collect();

    let entries: Vec<&str> = core
        .iter()
        .map(|n| n.key.as_str())
        .filter(|k| !core_edges.iter().any(|e| e.to == *k))
        .collect();
    let exits: Vec<&str> = core
        .iter()
        .map(|n| n.key.as_str())
        .filter(|k| !core_edges.iter().any(|e| e.from == *k))
        .collect();

    if entries.len() != 1 {
        return Err(format!(
            "expected one entry node, found {} ({})",
            entries.len(),
            entries.join(", ")
        ));
    }
    if exits.len() != 1 {
        return Err(format!(
            "expected one exit node, found {} ({})",
            exits.len(),
            exits.join(", ")
        ));
    }

    Ok(ChildShape {
        entry: entries[0].to_string(),
        exit: exits[0].to_string(),
    })
}

/// Replace `target` in `nodes`/`edges` with the work nodes of `child`.
///
/// Child keys become `{target}{separator}{key}`, suffixed `~2`, `~3`, ...
/// on collision. Edges into the target now enter the child's entry node and
/// edges out of the target leave its exit node, keeping their kind.
pub fn splice(
    nodes: &mut Vec<NodeTemplate>,
    edges: &mut Vec<EdgeTemplate>,
    target: &str,
    child: &WorkflowTemplate,
    separator: &str,
) -> std::result::Result<(), String> {
    let position = nodes
        .iter()
        .position(|n| n.key == target)
        .ok_or_else(|| format!("target node '{}' is not in the template", target))?;
    if nodes[position].kind.is_placeholder() {
        return Err(format!("target node '{}' is a placeholder", target));
    }
    let shape = child_shape(child)?;

    let mut taken: HashSet<String> = nodes
        .iter()
        .filter(|n| n.key != target)
        .map(|n| n.key.clone())
        .collect();
    let mut renamed: HashMap<&str, String> = HashMap::new();
    let mut inserted = Vec::new();
    for node in child.nodes.iter().filter(|n| !n.kind.is_placeholder()) {
        let base = format!("{}{}{}", target, separator, node.key);
        let mut key = base.clone();
        let mut n = 2;
        while taken.contains(&key) {
            key = format!("{}~{}", base, n);
            n += 1;
        }
        taken.insert(key.clone());
        renamed.insert(node.key.as_str(), key.clone());
        inserted.push(NodeTemplate {
            key,
            ..node.clone()
        });
    }
    nodes.splice(position..=position, inserted);

    let lookup = |key: &str| {
        renamed
            .get(key)
            .cloned()
            .ok_or_else(|| format!("child node '{}' was not renamed", key))
    };
    let entry = lookup(&shape.entry)?;
    let exit = lookup(&shape.exit)?;
    for edge in edges.iter_mut() {
        if edge.to == target {
            edge.to = entry.clone();
        } else if edge.from == target {
            edge.from = exit.clone();
        }
    }
    for edge in &child.edges {
        if let (Some(from), Some(to)) = (
            renamed.get(edge.from.as_str()),
            renamed.get(edge.to.as_str()),
        ) {
            edges.push(EdgeTemplate {
                from: from.clone(),
                to: to.clone(),
                kind: edge.kind.clone(),
            });
        }
    }
    Ok(())
}

/// An edge by its endpoints.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EdgeRef {
    pub from: String,
    pub to: String,
}

impl std::fmt::Display for EdgeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Structural difference between two node/edge sets, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeDelta {
    pub added_nodes: Vec<String>,
    pub removed_nodes: Vec<String>,
    pub added_edges: Vec<EdgeRef>,
    pub removed_edges: Vec<EdgeRef>,
}

impl MergeDelta {
    pub fn compute(
        before_nodes: &[NodeTemplate],
        before_edges: &[EdgeTemplate],
        after_nodes: &[NodeTemplate],
        after_edges: &[EdgeTemplate],
    ) -> Self {
        let before_n: BTreeSet<&str> = before_nodes.iter().map(|n| n.key.as_str()).collect();
        let after_n: BTreeSet<&str> = after_nodes.iter().map(|n| n.key.as_str()).collect();
        let edge_set = |edges: &[EdgeTemplate]| -> BTreeSet<EdgeRef> {
            edges
                .iter()
                .map(|e| EdgeRef {
                    from: e.from.clone(),
                    to: e.to.clone(),
                })
                .collect()
        };
        let before_e = edge_set(before_edges);
        let after_e = edge_set(after_edges);

        Self {
            added_nodes: after_n.difference(&before_n).map(|s| s.to_string()).collect(),
            removed_nodes: before_n.difference(&after_n).map(|s| s.to_string()).collect(),
            added_edges: after_e.difference(&before_e).cloned().collect(),
            removed_edges: before_e.difference(&after_e).cloned().collect(),
        }
    }

    /// Delta between two stored template versions.
    pub fn between(before: &WorkflowTemplate, after: &WorkflowTemplate) -> Self {
        Self::compute(&before.nodes, &before.edges, &after.nodes, &after.edges)
    }
}

/// One replacement in a merge.
pub struct Step<'a> {
    pub subdivision: &'a SubdivisionId,
    pub target: &'a str,
    pub child: &'a WorkflowTemplate,
}

/// Result of applying every step to a copy of the parent.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub nodes: Vec<NodeTemplate>,
    pub edges: Vec<EdgeTemplate>,
    pub delta: MergeDelta,
}

/// Apply the steps in order to a copy of `parent` and validate the result.
/// The parent itself is never modified.
pub fn plan(parent: &WorkflowTemplate, steps: &[Step<'_>], separator: &str) -> Result<MergePlan> {
    let mut nodes = parent.nodes.clone();
    let mut edges = parent.edges.clone();

    for step in steps {
        splice(&mut nodes, &mut edges, step.target, step.child, separator).map_err(|reason| {
            TaskweaveError::MergeIncompatible {
                subdivision: step.subdivision.to_string(),
                reason,
            }
        })?;
    }

    let design = WorkflowDesign {
        name: parent.name.clone(),
        description: parent.description.clone(),
        nodes,
        edges,
    };
    design.validate()?;

    let delta = MergeDelta::compute(&parent.nodes, &parent.edges, &design.nodes, &design.edges);
    Ok(MergePlan {
        nodes: design.nodes,
        edges: design.edges,
        delta,
    })
}
