//! Workflow templates: versioned node/edge definitions.
//!
//! A [`WorkflowDesign`] is what a human (or the subdivision dialog) draws.
//! Once validated and stored it becomes a [`WorkflowTemplate`], which is
//! immutable: merges produce new versions within the same lineage.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskweaveError};
use crate::graph::Graph;
use crate::types::{NodeKind, TemplateId};

/// A node in a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Template-local identifier, unique within one template.
    pub key: String,
    /// Human-readable name, used as the task title.
    pub name: String,
    /// Static task description carried onto every task for this node.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: NodeKind,
}

impl NodeTemplate {
    pub fn new(key: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: String::new(),
            kind,
        }
    }

    pub fn human(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(key, name, NodeKind::Human)
    }

    pub fn start(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(key.clone(), key, NodeKind::Start)
    }

    pub fn end(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(key.clone(), key, NodeKind::End)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// How an edge is traversed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Sequential,
    /// Carries a condition descriptor for whoever works the downstream task.
    /// Activation still waits on the source node like any other edge.
    Conditional { condition: String },
}

/// A directed dependency `from → to` between two template nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeTemplate {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: EdgeKind,
}

impl EdgeTemplate {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Sequential,
        }
    }

    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Conditional {
                condition: condition.into(),
            },
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self.kind, EdgeKind::Conditional { .. })
    }
}

/// An unsaved graph definition, as authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDesign {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<NodeTemplate>,
    #[serde(default)]
    pub edges: Vec<EdgeTemplate>,
}

impl WorkflowDesign {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn node(mut self, node: NodeTemplate) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(EdgeTemplate::new(from, to));
        self
    }

    pub fn with_edge(mut self, edge: EdgeTemplate) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn graph(&self) -> Graph {
        Graph::new(&self.nodes, &self.edges)
    }

    pub fn get_node(&self, key: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// Check structural well-formedness.
    ///
    /// Rejects empty designs, duplicate keys, edges to unknown nodes,
    /// self-loops, duplicate edges, cycles, placeholders used the wrong way
    /// round, and components without an entry or exit.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(TaskweaveError::Validation(format!(
                "workflow '{}' has no nodes",
                self.name
            )));
        }

        let mut keys = HashSet::new();
        for node in &self.nodes {
            if node.key.trim().is_empty() {
                return Err(TaskweaveError::Validation("node key is empty".into()));
            }
            if !keys.insert(node.key.as_str()) {
                return Err(TaskweaveError::Validation(format!(
                    "duplicate node key '{}'",
                    node.key
                )));
            }
        }

        let mut seen_edges = HashSet::new();
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !keys.contains(end.as_str()) {
                    return Err(TaskweaveError::Validation(format!(
                        "edge {} -> {} references missing node '{}'",
                        edge.from, edge.to, end
                    )));
                }
            }
            if edge.from == edge.to {
                return Err(TaskweaveError::Validation(format!(
                    "node '{}' depends on itself",
                    edge.from
                )));
            }
            if !seen_edges.insert((edge.from.as_str(), edge.to.as_str())) {
                return Err(TaskweaveError::Validation(format!(
                    "duplicate edge {} -> {}",
                    edge.from, edge.to
                )));
            }
        }

        let graph = self.graph();
        if graph.topological_order().is_none() {
            return Err(TaskweaveError::Validation(format!(
                "workflow '{}' contains a cycle",
                self.name
            )));
        }

        for node in &self.nodes {
            match node.kind {
                NodeKind::Start if !graph.upstream(&node.key).is_empty() => {
                    return Err(TaskweaveError::Validation(format!(
                        "start placeholder '{}' has incoming edges",
                        node.key
                    )));
                }
                NodeKind::End if !graph.downstream(&node.key).is_empty() => {
                    return Err(TaskweaveError::Validation(format!(
                        "end placeholder '{}' has outgoing edges",
                        node.key
                    )));
                }
                _ => {}
            }
        }

        // An acyclic component always has a root and a leaf; this guards
        // against future relaxations of the cycle check.
        for component in graph.components() {
            let has_entry = component.iter().any(|k| graph.upstream(k).is_empty());
            let has_exit = component.iter().any(|k| graph.downstream(k).is_empty());
            if !has_entry || !has_exit {
                return Err(TaskweaveError::Validation(format!(
                    "component containing '{}' lacks an entry or exit node",
                    component[0]
                )));
            }
        }

        Ok(())
    }
}

/// A stored, immutable template version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    /// Id of the first version in this template's history.
    pub lineage: TemplateId,
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeTemplate>,
    pub edges: Vec<EdgeTemplate>,
    /// The version this one was merged from.
    #[serde(default)]
    pub derived_from: Option<TemplateId>,
    /// Set when a later version explicitly replaces this one.
    #[serde(default)]
    pub superseded_by: Option<TemplateId>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    /// Validate a design and turn it into the first version of a new lineage.
    pub fn from_design(design: WorkflowDesign) -> Result<Self> {
        design.validate()?;
        let id = TemplateId::new();
        Ok(Self {
            lineage: id.clone(),
            id,
            version: 1,
            name: design.name,
            description: design.description,
            nodes: design.nodes,
            edges: design.edges,
            derived_from: None,
            superseded_by: None,
            created_at: Utc::now(),
        })
    }

    pub fn graph(&self) -> Graph {
        Graph::new(&self.nodes, &self.edges)
    }

    pub fn get_node(&self, key: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// The node/edge structure as a design, e.g. for re-validation.
    pub fn design(&self) -> WorkflowDesign {
        WorkflowDesign {
            name: self.name.clone(),
            description: self.description.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowDesign {
        WorkflowDesign::new("linear")
            .node(NodeTemplate::human("a", "A"))
            .node(NodeTemplate::human("b", "B"))
            .node(NodeTemplate::human("c", "C"))
            .edge("a", "b")
            .edge("b", "c")
    }

    #[test]
    fn test_valid_linear_design() {
        assert!(linear().validate().is_ok());
    }

    #[test]
    fn test_rejects_missing_node_reference() {
        let design = linear().edge("c", "ghost");
        let err = design.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rejects_cycle() {
        let design = linear().edge("c", "a");
        assert!(matches!(
            design.validate(),
            Err(TaskweaveError::Validation(msg)) if msg.contains("cycle")
        ));
    }

    #[test]
    fn test_rejects_duplicate_key_and_edge() {
        let dup_key = linear().node(NodeTemplate::human("a", "again"));
        assert!(dup_key.validate().is_err());

        let dup_edge = linear().edge("a", "b");
        assert!(dup_edge.validate().is_err());
    }

    #[test]
    fn test_rejects_misplaced_placeholders() {
        let design = WorkflowDesign::new("bad")
            .node(NodeTemplate::human("a", "A"))
            .node(NodeTemplate::start("s"))
            .edge("a", "s");
        assert!(design.validate().is_err());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(WorkflowDesign::new("empty").validate().is_err());
    }

    #[test]
    fn test_from_design_starts_lineage() {
        let tpl = WorkflowTemplate::from_design(linear()).unwrap();
        assert_eq!(tpl.version, 1);
        assert_eq!(tpl.lineage, tpl.id);
        assert!(tpl.derived_from.is_none());
        assert_eq!(tpl.graph().entry_points(), vec!["a"]);
    }

    #[test]
    fn test_design_from_toml() {
        let toml_str = r#"
name = "review"

[[nodes]]
key = "draft"
name = "Draft"

[[nodes]]
key = "check"
name = "Check"
kind = "system"

[[edges]]
from = "draft"
to = "check"
kind = { type = "conditional", condition = "draft_status == \"ready\"" }
"#;
        let design: WorkflowDesign = toml::from_str(toml_str).unwrap();
        assert_eq!(design.nodes[0].kind, NodeKind::Human);
        assert_eq!(design.nodes[1].kind, NodeKind::System);
        assert!(design.edges[0].is_conditional());
        assert!(design.validate().is_ok());
    }
}
