use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use taskweave_core::config::{AppConfig, MergeConfig};
use taskweave_core::error::{Result, TaskweaveError};
use taskweave_core::event::{EngineEvent, EventBus};
use taskweave_core::instance::{
    InstanceStats, NodeInstance, NodePatch, TaskInstance, WorkflowInstance,
};
use taskweave_core::template::{WorkflowDesign, WorkflowTemplate};
use taskweave_core::traits::GraphStore;
use taskweave_core::types::*;

use crate::dispatch::{Work, WorkQueue};
use crate::instantiator::TaskInstantiator;
use crate::tracker::DependencyTracker;

/// Runtime knobs taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_task_retries: u32,
    pub auto_complete_placeholders: bool,
    pub event_capacity: usize,
    pub max_depth: usize,
    pub merge: MergeConfig,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_task_retries: config.engine.max_task_retries,
            auto_complete_placeholders: config.engine.auto_complete_placeholders,
            event_capacity: config.engine.event_capacity,
            max_depth: config.aggregator.max_depth,
            merge: config.merge.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Workflow execution engine.
///
/// Wraps a [`GraphStore`] and drives instances forward: every call that
/// changes state drains the resulting cascade (activations, task creation,
/// instance completion, subdivision hand-back) before it returns. All
/// coordination goes through compare-and-set updates in the store, so one
/// engine can be shared across threads.
pub struct Engine {
    store: Arc<dyn GraphStore>,
    events: Arc<EventBus>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(store: Arc<dyn GraphStore>, settings: EngineSettings) -> Self {
        let events = Arc::new(EventBus::new(settings.event_capacity));
        Self {
            store,
            events,
            settings,
        }
    }

    pub fn from_config(store: Arc<dyn GraphStore>, config: &AppConfig) -> Self {
        Self::new(store, EngineSettings::from_config(config))
    }

    pub fn store(&self) -> &dyn GraphStore {
        self.store.as_ref()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        self.events.publish(event);
    }

    // Templates

    /// Validate a design and store it as version 1 of a new template.
    pub fn import_template(&self, design: WorkflowDesign) -> Result<WorkflowTemplate> {
        let template = WorkflowTemplate::from_design(design)?;
        self.store.insert_template(&template)?;
        info!(template_id = %template.id, name = %template.name, "Template imported");
        self.publish(EngineEvent::TemplateCreated {
            template_id: template.id.clone(),
            version: template.version,
        });
        Ok(template)
    }

    pub fn get_template(&self, id: &TemplateId) -> Result<WorkflowTemplate> {
        self.store.get_template(id)
    }

    pub fn list_templates(&self) -> Result<Vec<WorkflowTemplate>> {
        self.store.list_templates()
    }

    // Instances

    /// Create a pending instance with one `Created` node per template node.
    pub fn create_instance(
        &self,
        template_id: &TemplateId,
        context: Value,
    ) -> Result<WorkflowInstance> {
        let template = self.store.get_template(template_id)?;
        let instance = WorkflowInstance::new(template.id.clone(), context);
        let nodes = nodes_for(&instance, &template);
        self.store.create_instance(&instance, &nodes)?;
        info!(instance_id = %instance.id, template = %template.name, "Instance created");
        Ok(instance)
    }

    /// Start a pending instance: nodes move to `Waiting` and every root node
    /// is activated.
    pub fn start_instance(&self, id: &InstanceId) -> Result<()> {
        if !self.store.start_instance(id)? {
            let instance = self.store.get_instance(id)?;
            return Err(TaskweaveError::StateConflict(format!(
                "instance {} is {}, not pending",
                id, instance.status
            )));
        }
        self.publish(EngineEvent::InstanceStarted {
            instance_id: id.clone(),
        });
        info!(instance_id = %id, "Instance started");
        self.drain(self.seed_roots(id)?)
    }

    /// Create and start an instance in one step.
    pub fn launch(&self, template_id: &TemplateId, context: Value) -> Result<WorkflowInstance> {
        let instance = self.create_instance(template_id, context)?;
        self.start_instance(&instance.id)?;
        self.store.get_instance(&instance.id)
    }

    pub(crate) fn seed_roots(&self, id: &InstanceId) -> Result<WorkQueue> {
        let instance = self.store.get_instance(id)?;
        let graph = self.store.get_template(&instance.template_id)?.graph();
        let mut queue = WorkQueue::new();
        for key in graph.entry_points() {
            let node = self.store.find_node(id, &key)?;
            queue.push(Work::Activate(node.id));
        }
        Ok(queue)
    }

    /// Re-check every waiting node of an instance. Completions that landed
    /// while the instance was not running left their successors waiting.
    pub(crate) fn recheck_waiting(&self, id: &InstanceId) -> Result<WorkQueue> {
        let mut queue = WorkQueue::new();
        for node in self.store.list_nodes(id)? {
            if node.status == NodeStatus::Waiting {
                queue.push(Work::Activate(node.id));
            }
        }
        Ok(queue)
    }

    pub fn get_instance(&self, id: &InstanceId) -> Result<WorkflowInstance> {
        self.store.get_instance(id)
    }

    pub fn list_instances(&self, template: Option<&TemplateId>) -> Result<Vec<WorkflowInstance>> {
        self.store.list_instances(template)
    }

    pub fn list_nodes(&self, id: &InstanceId) -> Result<Vec<NodeInstance>> {
        self.store.list_nodes(id)
    }

    /// Node counts by status and percent complete.
    pub fn stats(&self, id: &InstanceId) -> Result<InstanceStats> {
        Ok(InstanceStats::from_nodes(&self.store.list_nodes(id)?))
    }

    /// Cancel an instance, its open tasks, and any child instances spawned
    /// by its subdivisions.
    pub fn cancel_instance(&self, id: &InstanceId) -> Result<()> {
        let instance = self.store.get_instance(id)?;
        if instance.status.is_terminal() {
            return Err(TaskweaveError::StateConflict(format!(
                "instance {} is already {}",
                id, instance.status
            )));
        }
        self.drain(WorkQueue::of(Work::Cancel(id.clone())))
    }

    // Activation

    /// Try to move a waiting node to `Ready`; on success its task is created.
    pub fn try_activate(&self, id: &NodeInstanceId) -> Result<bool> {
        let activated = DependencyTracker::new(self.store()).try_activate(id)?;
        if activated {
            let node = self.store.get_node(id)?;
            self.publish(EngineEvent::NodeReady {
                instance_id: node.instance_id,
                node_id: node.id,
                node_key: node.node_key,
            });
            self.drain(WorkQueue::of(Work::Instantiate(id.clone())))?;
        }
        Ok(activated)
    }

    /// Create the task for a ready node if it does not have one yet.
    pub fn on_node_ready(&self, id: &NodeInstanceId) -> Result<Option<TaskInstance>> {
        let task = TaskInstantiator::new(self.store()).on_node_ready(id)?;
        if let Some(task) = &task {
            self.publish(EngineEvent::TaskCreated {
                instance_id: task.instance_id.clone(),
                task_id: task.id.clone(),
                node_key: task.node_key.clone(),
            });
        }
        Ok(task)
    }

    // Tasks

    pub fn get_task(&self, id: &TaskId) -> Result<TaskInstance> {
        self.store.get_task(id)
    }

    pub fn list_tasks(&self, instance: &InstanceId) -> Result<Vec<TaskInstance>> {
        self.store.list_tasks(instance)
    }

    /// Open tasks of an instance whose nodes are ready or running.
    pub fn open_tasks(&self, instance: &InstanceId) -> Result<Vec<TaskInstance>> {
        Ok(self
            .store
            .list_tasks(instance)?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Open)
            .collect())
    }

    /// Claim a ready task: node `Ready → Running`.
    pub fn start_task(&self, id: &TaskId) -> Result<()> {
        let task = self.open_task(id)?;
        self.move_node(&task, NodeStatus::Ready, NodeStatus::Running)?;
        self.publish_started(&task);
        Ok(())
    }

    /// Record a task's result, completing its node and cascading downstream.
    pub fn submit_result(&self, id: &TaskId, result: Value) -> Result<()> {
        let task = self.open_task(id)?;
        let node = self.store.get_node(&task.node_instance_id)?;
        if node.status == NodeStatus::Blocked {
            return Err(TaskweaveError::StateConflict(format!(
                "task {} is blocked; resume it before submitting",
                id
            )));
        }
        self.claim(&task)?;
        if !self.store.complete_task(id, &result)? {
            return Err(TaskweaveError::StateConflict(format!(
                "task {} can no longer be submitted",
                id
            )));
        }
        info!(task_id = %id, node_key = %task.node_key, "Task submitted");
        self.drain(WorkQueue::of(Work::Completed(node.id)))
    }

    /// Fail a task. Its node and instance are marked failed; nothing is
    /// propagated to a parent task.
    pub fn fail_task(&self, id: &TaskId, error: &str) -> Result<()> {
        let task = self.open_task(id)?;
        self.claim(&task)?;
        if !self.store.fail_task(id, error)? {
            return Err(TaskweaveError::StateConflict(format!(
                "task {} cannot fail from its node's current status",
                id
            )));
        }
        warn!(task_id = %id, node_key = %task.node_key, error, "Task failed");
        self.publish(EngineEvent::NodeFailed {
            instance_id: task.instance_id.clone(),
            node_id: task.node_instance_id.clone(),
            node_key: task.node_key.clone(),
            error: error.to_string(),
        });
        self.drain(WorkQueue::of(Work::Finished(task.instance_id)))
    }

    /// Reopen a failed task for another attempt.
    pub fn retry_task(&self, id: &TaskId) -> Result<TaskInstance> {
        let task = self.store.get_task(id)?;
        if task.status != TaskStatus::Failed {
            return Err(TaskweaveError::StateConflict(format!(
                "task {} is {}, only failed tasks can be retried",
                id, task.status
            )));
        }
        let node = self.store.get_node(&task.node_instance_id)?;
        if node.retry_count >= self.settings.max_task_retries {
            return Err(TaskweaveError::RetryLimit {
                task: id.to_string(),
                limit: self.settings.max_task_retries,
            });
        }
        if !self.store.reopen_task(id)? {
            return Err(TaskweaveError::StateConflict(format!(
                "task {} was changed concurrently",
                id
            )));
        }

        let task = self.store.get_task(id)?;
        info!(task_id = %id, attempt = task.attempt, "Task retried");
        self.publish(EngineEvent::TaskRetried {
            task_id: id.clone(),
            attempt: task.attempt,
        });
        self.drain(self.recheck_waiting(&task.instance_id)?)?;
        Ok(task)
    }

    /// Park a running task: node `Running → Blocked`.
    pub fn block_task(&self, id: &TaskId) -> Result<()> {
        let task = self.open_task(id)?;
        self.move_node(&task, NodeStatus::Running, NodeStatus::Blocked)?;
        self.publish(EngineEvent::NodeBlocked {
            instance_id: task.instance_id,
            node_id: task.node_instance_id,
        });
        Ok(())
    }

    /// Resume a blocked task: node `Blocked → Running`.
    pub fn resume_task(&self, id: &TaskId) -> Result<()> {
        let task = self.open_task(id)?;
        self.move_node(&task, NodeStatus::Blocked, NodeStatus::Running)?;
        self.publish(EngineEvent::NodeResumed {
            instance_id: task.instance_id,
            node_id: task.node_instance_id,
        });
        Ok(())
    }

    pub(crate) fn open_task(&self, id: &TaskId) -> Result<TaskInstance> {
        let task = self.store.get_task(id)?;
        if task.status != TaskStatus::Open {
            return Err(TaskweaveError::StateConflict(format!(
                "task {} is {}",
                id, task.status
            )));
        }
        Ok(task)
    }

    /// Claim a ready node for its task: `Ready → Running`. Any other
    /// status is left for the caller's own compare-and-set to reject.
    pub(crate) fn claim(&self, task: &TaskInstance) -> Result<()> {
        let claimed = self.store.transition_node(
            &task.node_instance_id,
            &[NodeStatus::Ready],
            NodeStatus::Running,
            &NodePatch::default(),
        )?;
        if claimed {
            self.publish_started(task);
        }
        Ok(())
    }

    fn publish_started(&self, task: &TaskInstance) {
        self.publish(EngineEvent::NodeStarted {
            instance_id: task.instance_id.clone(),
            node_id: task.node_instance_id.clone(),
            node_key: task.node_key.clone(),
        });
    }

    fn move_node(&self, task: &TaskInstance, from: NodeStatus, to: NodeStatus) -> Result<()> {
        let moved = self.store.transition_node(
            &task.node_instance_id,
            &[from],
            to,
            &NodePatch::default(),
        )?;
        if !moved {
            let node = self.store.get_node(&task.node_instance_id)?;
            return Err(TaskweaveError::StateConflict(format!(
                "node '{}' is {}, expected {}",
                task.node_key, node.status, from
            )));
        }
        Ok(())
    }
}

/// One fresh node instance per template node, in declaration order.
pub(crate) fn nodes_for(
    instance: &WorkflowInstance,
    template: &WorkflowTemplate,
) -> Vec<NodeInstance> {
    template
        .nodes
        .iter()
        .map(|n| NodeInstance::new(instance.id.clone(), n.key.clone()))
        .collect()
}
