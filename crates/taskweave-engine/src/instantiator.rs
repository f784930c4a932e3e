use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use taskweave_core::error::{Result, TaskweaveError};
use taskweave_core::instance::TaskInstance;
use taskweave_core::traits::GraphStore;
use taskweave_core::types::{NodeInstanceId, NodeKind, NodeStatus, TaskId, TaskStatus};

use crate::tracker::task_input;

/// Creates the single task for a node that just became ready.
pub struct TaskInstantiator<'a> {
    store: &'a dyn GraphStore,
}

impl<'a> TaskInstantiator<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self { store }
    }

    /// Create the node's task unless one already exists.
    ///
    /// Returns the new task, or `None` when the node is not ready or a task
    /// was created earlier. The unique node ↔ task constraint in the store
    /// settles concurrent callers.
    pub fn on_node_ready(&self, id: &NodeInstanceId) -> Result<Option<TaskInstance>> {
        let node = self.store.get_node(id)?;
        if node.status != NodeStatus::Ready {
            debug!(node_id = %id, status = %node.status, "Node not ready, no task created");
            return Ok(None);
        }

        let instance = self.store.get_instance(&node.instance_id)?;
        let template = self.store.get_template(&instance.template_id)?;
        let spec = template
            .get_node(&node.node_key)
            .ok_or_else(|| TaskweaveError::not_found("template node", &node.node_key))?;

        let now = Utc::now();
        let task = TaskInstance {
            id: TaskId::new(),
            node_instance_id: node.id.clone(),
            instance_id: instance.id.clone(),
            node_key: node.node_key.clone(),
            title: spec.name.clone(),
            description: spec.description.clone(),
            kind: spec.kind,
            status: TaskStatus::Open,
            input: node
                .input
                .clone()
                .unwrap_or_else(|| task_input(&instance.context, Map::new())),
            result: None,
            reference_result: None,
            attempt: 1,
            created_at: now,
            updated_at: now,
        };

        if !self.store.create_task(&task)? {
            debug!(node_id = %id, "Task already exists");
            return Ok(None);
        }
        debug!(node_id = %id, task_id = %task.id, "Task created");
        Ok(Some(task))
    }
}

/// Output recorded for an auto-completed start or end placeholder.
///
/// A start node passes the workflow context through; an end node passes its
/// single upstream output through, or the map of all of them.
pub fn passthrough(task: &TaskInstance) -> Value {
    if task.kind == NodeKind::Start {
        return task.input.get("context").cloned().unwrap_or(Value::Null);
    }
    match task.input.get("upstream") {
        Some(Value::Object(map)) if map.len() == 1 => {
            map.values().next().cloned().unwrap_or(Value::Null)
        }
        Some(upstream) => upstream.clone(),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskweave_core::instance::{NodeInstance, NodePatch, WorkflowInstance};
    use taskweave_core::template::{NodeTemplate, WorkflowDesign, WorkflowTemplate};
    use taskweave_store::SqliteStore;

    fn setup() -> (SqliteStore, NodeInstance) {
        let store = SqliteStore::in_memory().unwrap();
        let tpl = WorkflowTemplate::from_design(
            WorkflowDesign::new("single").node(
                NodeTemplate::human("write", "Write report").with_description("Two pages"),
            ),
        )
        .unwrap();
        store.insert_template(&tpl).unwrap();
        let instance = WorkflowInstance::new(tpl.id.clone(), json!({}));
        let node = NodeInstance::new(instance.id.clone(), "write");
        store.create_instance(&instance, &[node.clone()]).unwrap();
        store.start_instance(&instance.id).unwrap();
        (store, node)
    }

    #[test]
    fn test_no_task_before_ready() {
        let (store, node) = setup();
        let instantiator = TaskInstantiator::new(&store);
        assert!(instantiator.on_node_ready(&node.id).unwrap().is_none());
        assert!(store.task_for_node(&node.id).unwrap().is_none());
    }

    #[test]
    fn test_creates_exactly_one_task() {
        let (store, node) = setup();
        store
            .transition_node(
                &node.id,
                &[NodeStatus::Waiting],
                NodeStatus::Ready,
                &NodePatch::default(),
            )
            .unwrap();
        let instantiator = TaskInstantiator::new(&store);

        let task = instantiator.on_node_ready(&node.id).unwrap().unwrap();
        assert_eq!(task.title, "Write report");
        assert_eq!(task.description, "Two pages");
        assert_eq!(task.attempt, 1);
        assert!(instantiator.on_node_ready(&node.id).unwrap().is_none());
        assert_eq!(store.list_tasks(&node.instance_id).unwrap().len(), 1);
    }

    #[test]
    fn test_passthrough() {
        let mut task = TaskInstance {
            id: TaskId::new(),
            node_instance_id: NodeInstanceId::new(),
            instance_id: taskweave_core::types::InstanceId::new(),
            node_key: "end".into(),
            title: "end".into(),
            description: String::new(),
            kind: NodeKind::End,
            status: TaskStatus::Open,
            input: json!({"context": {"c": 1}, "upstream": {"y": {"done": true}}}),
            result: None,
            reference_result: None,
            attempt: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(passthrough(&task), json!({"done": true}));

        task.kind = NodeKind::Start;
        assert_eq!(passthrough(&task), json!({"c": 1}));
    }
}
