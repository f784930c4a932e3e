//! Execution-time records: instances, node states, tasks, and subdivisions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    InstanceId, InstanceStatus, NodeInstanceId, NodeKind, NodeStatus, SubdivisionId,
    SubdivisionStatus, TaskId, TaskStatus, TemplateId,
};

/// One execution of a template version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    pub status: InstanceStatus,
    /// Workflow-global context handed to every task's input.
    pub context: serde_json::Value,
    /// Set when this instance was spawned by a subdivision.
    pub parent_subdivision: Option<SubdivisionId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(template_id: TemplateId, context: serde_json::Value) -> Self {
        Self {
            id: InstanceId::new(),
            template_id,
            status: InstanceStatus::Pending,
            context,
            parent_subdivision: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_parent(mut self, subdivision: SubdivisionId) -> Self {
        self.parent_subdivision = Some(subdivision);
        self
    }
}

/// Execution state of one template node inside one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeInstanceId,
    pub instance_id: InstanceId,
    pub node_key: String,
    pub status: NodeStatus,
    pub retry_count: u32,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeInstance {
    pub fn new(instance_id: InstanceId, node_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: NodeInstanceId::new(),
            instance_id,
            node_key: node_key.into(),
            status: NodeStatus::Created,
            retry_count: 0,
            input: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Optional field updates applied together with a status change.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub increment_retry: bool,
}

/// Work presented to a human or agent for one ready node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskId,
    pub node_instance_id: NodeInstanceId,
    pub instance_id: InstanceId,
    pub node_key: String,
    pub title: String,
    pub description: String,
    pub kind: NodeKind,
    pub status: TaskStatus,
    /// Upstream outputs plus workflow context.
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    /// Output of a completed subdivision held for human review.
    pub reference_result: Option<serde_json::Value>,
    /// 1 for the first attempt, incremented by each retry.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link from an in-flight task to the child instance that decomposes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subdivision {
    pub id: SubdivisionId,
    pub task_id: TaskId,
    pub parent_instance_id: InstanceId,
    pub parent_node_key: String,
    /// Template the child was instantiated from.
    pub template_id: Option<TemplateId>,
    /// `None` when the attempt was rejected before a child existed.
    pub child_instance_id: Option<InstanceId>,
    pub name: String,
    pub description: String,
    pub execute_immediately: bool,
    pub auto_submit: bool,
    pub status: SubdivisionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subdivision {
    /// Whether this subdivision produced a child instance.
    pub fn is_active(&self) -> bool {
        self.child_instance_id.is_some()
    }
}

/// Node counts for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub total: usize,
    pub by_status: BTreeMap<NodeStatus, usize>,
    pub percent_complete: f64,
}

impl InstanceStats {
    pub fn from_nodes(nodes: &[NodeInstance]) -> Self {
        let mut by_status = BTreeMap::new();
        for node in nodes {
            *by_status.entry(node.status).or_insert(0) += 1;
        }
        let completed = by_status.get(&NodeStatus::Completed).copied().unwrap_or(0);
        let percent_complete = if nodes.is_empty() {
            0.0
        } else {
            (completed as f64 / nodes.len() as f64) * 100.0
        };
        Self {
            total: nodes.len(),
            by_status,
            percent_complete,
        }
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}
