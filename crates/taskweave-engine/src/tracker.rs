use serde_json::{json, Map, Value};
use tracing::debug;

use taskweave_core::error::Result;
use taskweave_core::graph::Graph;
use taskweave_core::instance::{NodeInstance, NodePatch, WorkflowInstance};
use taskweave_core::traits::GraphStore;
use taskweave_core::types::{InstanceStatus, NodeInstanceId, NodeStatus};

/// Decides when a waiting node may run.
///
/// A node is eligible once every immediate upstream node is `Completed`
/// (AND-join). Activation is a compare-and-set `Waiting → Ready`, so any
/// number of redundant or concurrent calls activate a node at most once.
pub struct DependencyTracker<'a> {
    store: &'a dyn GraphStore,
}

impl<'a> DependencyTracker<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self { store }
    }

    /// Try to move a node from `Waiting` to `Ready`.
    ///
    /// Returns `false` without side effects when the node is not waiting,
    /// its instance is not running, or some upstream node is unfinished.
    pub fn try_activate(&self, id: &NodeInstanceId) -> Result<bool> {
        let node = self.store.get_node(id)?;
        if node.status != NodeStatus::Waiting {
            return Ok(false);
        }

        let instance = self.store.get_instance(&node.instance_id)?;
        if instance.status != InstanceStatus::Running {
            debug!(
                node_id = %id,
                status = %instance.status,
                "Instance not running, skipping activation"
            );
            return Ok(false);
        }

        let graph = self.store.get_template(&instance.template_id)?.graph();
        let Some(input) = self.collect_input(&instance, &node, &graph)? else {
            return Ok(false);
        };

        let patch = NodePatch {
            input: Some(input),
            ..NodePatch::default()
        };
        let activated =
            self.store
                .transition_node(id, &[NodeStatus::Waiting], NodeStatus::Ready, &patch)?;
        if activated {
            debug!(node_id = %id, node_key = %node.node_key, "Node activated");
        }
        Ok(activated)
    }

    /// Assemble the node's input from upstream outputs and the instance
    /// context, or `None` if some upstream node has not completed.
    fn collect_input(
        &self,
        instance: &WorkflowInstance,
        node: &NodeInstance,
        graph: &Graph,
    ) -> Result<Option<Value>> {
        let mut upstream = Map::new();
        for key in graph.upstream(&node.node_key) {
            let parent = self.store.find_node(&instance.id, key)?;
            if parent.status != NodeStatus::Completed {
                return Ok(None);
            }
            upstream.insert(key.clone(), parent.output.unwrap_or(Value::Null));
        }
        Ok(Some(task_input(&instance.context, upstream)))
    }
}

/// Task input payload: workflow context plus each upstream node's output.
pub fn task_input(context: &Value, upstream: Map<String, Value>) -> Value {
    json!({
        "context": context,
        "upstream": upstream,
    })
}
