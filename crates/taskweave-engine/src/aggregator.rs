//! Read-only view of nested subdivisions.
//!
//! The tree is an arena: [`TreeNode`]s live in one vector and refer to their
//! children by index. Traversal is breadth-first with an explicit queue, a
//! depth limit, and a visited set.

use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;

use serde::Serialize;
use tracing::{debug, warn};

use taskweave_core::error::Result;
use taskweave_core::instance::{InstanceStats, NodeInstance, Subdivision};
use taskweave_core::traits::GraphStore;
use taskweave_core::types::*;

use crate::engine::Engine;

/// Status of an instance derived from its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AggregateStatus {
    /// Completed if every node completed, failed if any node failed,
    /// running otherwise. A cancelled instance stays cancelled.
    pub fn derive(instance: InstanceStatus, nodes: &[NodeInstance]) -> Self {
        if instance == InstanceStatus::Cancelled {
            return Self::Cancelled;
        }
        if nodes.iter().any(|n| n.status == NodeStatus::Failed) {
            return Self::Failed;
        }
        if !nodes.is_empty() && nodes.iter().all(|n| n.status == NodeStatus::Completed) {
            return Self::Completed;
        }
        Self::Running
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// How a child instance hangs off its parent.
#[derive(Debug, Clone, Serialize)]
pub struct SubdivisionLink {
    pub subdivision_id: SubdivisionId,
    pub task_id: TaskId,
    pub parent_node_key: String,
    pub name: String,
    pub status: SubdivisionStatus,
}

impl From<&Subdivision> for SubdivisionLink {
    fn from(sub: &Subdivision) -> Self {
        Self {
            subdivision_id: sub.id.clone(),
            task_id: sub.task_id.clone(),
            parent_node_key: sub.parent_node_key.clone(),
            name: sub.name.clone(),
            status: sub.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,
    pub template_name: String,
    pub depth: usize,
    /// `None` for the root.
    pub link: Option<SubdivisionLink>,
    pub status: AggregateStatus,
    pub stats: InstanceStats,
    /// Indices into [`SubdivisionTree::nodes`].
    pub children: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubdivisionTree {
    /// Index 0 is the root.
    pub nodes: Vec<TreeNode>,
    pub max_depth: usize,
    /// Whether some subdivisions were left out.
    pub truncated: bool,
    pub issues: Vec<String>,
}

impl SubdivisionTree {
    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &TreeNode> {
        self.nodes[index].children.iter().map(move |&i| &self.nodes[i])
    }

    /// Deepest level present in the tree.
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Indented text rendering, one line per instance.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            let indent = "  ".repeat(node.depth);
            let _ = write!(
                out,
                "{}{} [{}] {} {:.0}%",
                indent,
                node.template_name,
                node.status.as_str(),
                node.instance_id.short(),
                node.stats.percent_complete
            );
            if let Some(link) = &node.link {
                let _ = write!(
                    out,
                    "  <- '{}' from {} ({})",
                    link.name, link.parent_node_key, link.status
                );
            }
            out.push('\n');
            stack.extend(node.children.iter().rev());
        }
        for issue in &self.issues {
            let _ = writeln!(out, "! {}", issue);
        }
        out
    }
}

/// Walk subdivision links below `root` down to `max_depth` levels.
pub fn build_subdivision_tree(
    store: &dyn GraphStore,
    root: &InstanceId,
    max_depth: usize,
) -> Result<SubdivisionTree> {
    let mut tree = SubdivisionTree {
        nodes: Vec::new(),
        max_depth,
        truncated: false,
        issues: Vec::new(),
    };
    let mut visited: HashSet<InstanceId> = HashSet::new();
    let mut queue: VecDeque<(InstanceId, usize, Option<usize>, Option<SubdivisionLink>)> =
        VecDeque::from([(root.clone(), 0, None, None)]);

    while let Some((id, depth, parent, link)) = queue.pop_front() {
        if !visited.insert(id.clone()) {
            warn!(instance_id = %id, "Subdivision cycle detected");
            tree.truncated = true;
            tree.issues
                .push(format!("instance {} reached twice, cycle not followed", id));
            continue;
        }

        let instance = store.get_instance(&id)?;
        let template = store.get_template(&instance.template_id)?;
        let nodes = store.list_nodes(&id)?;

        let index = tree.nodes.len();
        tree.nodes.push(TreeNode {
            instance_id: id.clone(),
            template_id: template.id,
            template_name: template.name,
            depth,
            link,
            status: AggregateStatus::derive(instance.status, &nodes),
            stats: InstanceStats::from_nodes(&nodes),
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            tree.nodes[parent].children.push(index);
        }

        let subs: Vec<Subdivision> = store
            .subdivisions_for_instance(&id)?
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        if subs.is_empty() {
            continue;
        }
        if depth >= max_depth {
            tree.truncated = true;
            tree.issues.push(format!(
                "depth limit {} reached at instance {}, {} subdivision(s) not expanded",
                max_depth,
                id.short(),
                subs.len()
            ));
            continue;
        }
        for sub in &subs {
            if let Some(child) = &sub.child_instance_id {
                queue.push_back((child.clone(), depth + 1, Some(index), Some(sub.into())));
            }
        }
    }

    debug!(
        root = %root,
        nodes = tree.nodes.len(),
        truncated = tree.truncated,
        "Subdivision tree built"
    );
    Ok(tree)
}

impl Engine {
    pub fn build_subdivision_tree(
        &self,
        id: &InstanceId,
        max_depth: usize,
    ) -> Result<SubdivisionTree> {
        build_subdivision_tree(self.store(), id, max_depth)
    }

    /// Subdivision tree using the configured depth limit.
    pub fn subdivision_tree(&self, id: &InstanceId) -> Result<SubdivisionTree> {
        self.build_subdivision_tree(id, self.settings().max_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use taskweave_core::instance::NodeInstance;

    fn nodes(statuses: &[NodeStatus]) -> Vec<NodeInstance> {
        let instance = InstanceId::new();
        statuses
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut n = NodeInstance::new(instance.clone(), format!("n{}", i));
                n.status = *s;
                n
            })
            .collect()
    }

    #[test]
    fn test_derive_status() {
        use NodeStatus::*;
        assert_eq!(
            AggregateStatus::derive(InstanceStatus::Running, &nodes(&[Completed, Completed])),
            AggregateStatus::Completed
        );
        assert_eq!(
            AggregateStatus::derive(InstanceStatus::Running, &nodes(&[Completed, Failed, Ready])),
            AggregateStatus::Failed
        );
        assert_eq!(
            AggregateStatus::derive(InstanceStatus::Running, &nodes(&[Completed, Blocked])),
            AggregateStatus::Running
        );
        assert_eq!(
            AggregateStatus::derive(InstanceStatus::Cancelled, &nodes(&[Cancelled])),
            AggregateStatus::Cancelled
        );
        assert_eq!(
            AggregateStatus::derive(InstanceStatus::Pending, &[]),
            AggregateStatus::Running
        );
    }

    #[test]
    fn test_cycle_is_reported_not_followed() {
        use std::sync::Arc;
        use taskweave_core::instance::Subdivision;
        use taskweave_core::template::{NodeTemplate, WorkflowDesign};
        use taskweave_store::SqliteStore;

        use crate::engine::EngineSettings;

        let engine = Engine::new(
            Arc::new(SqliteStore::in_memory().unwrap()),
            EngineSettings::default(),
        );
        let tpl = engine
            .import_template(WorkflowDesign::new("loop").node(NodeTemplate::human("a", "A")))
            .unwrap();
        let instance = engine.launch(&tpl.id, json!({})).unwrap();
        let task = engine.list_tasks(&instance.id).unwrap().remove(0);

        // A corrupt link pointing back at its own parent.
        let bogus = Subdivision {
            id: SubdivisionId::new(),
            task_id: task.id,
            parent_instance_id: instance.id.clone(),
            parent_node_key: "a".into(),
            template_id: Some(tpl.id.clone()),
            child_instance_id: Some(instance.id.clone()),
            name: "self".into(),
            description: String::new(),
            execute_immediately: false,
            auto_submit: false,
            status: SubdivisionStatus::Running,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        engine.store().insert_subdivision(&bogus, None, None).unwrap();

        let tree = engine.build_subdivision_tree(&instance.id, 8).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.truncated);
        assert_eq!(tree.issues.len(), 1);
        assert!(tree.render().contains("cycle"));
    }
}
