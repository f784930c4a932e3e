use crate::error::Result;
use crate::instance::{NodeInstance, NodePatch, Subdivision, TaskInstance, WorkflowInstance};
use crate::template::WorkflowTemplate;
use crate::types::*;

/// A child instance created together with its subdivision record.
#[derive(Debug, Clone, Copy)]
pub struct NewChild<'a> {
    pub instance: &'a WorkflowInstance,
    pub nodes: &'a [NodeInstance],
}

/// Graph store: the single shared persistence backend.
///
/// Every method is one transaction. Status-changing methods take the set of
/// statuses the row must currently be in and return `Ok(false)` when the row
/// had already moved on, so callers can treat lost races as no-ops.
pub trait GraphStore: Send + Sync + 'static {
    // Templates

    /// Persist a new template version.
    fn insert_template(&self, template: &WorkflowTemplate) -> Result<()>;

    fn get_template(&self, id: &TemplateId) -> Result<WorkflowTemplate>;

    fn list_templates(&self) -> Result<Vec<WorkflowTemplate>>;

    /// Highest version stored in a lineage (0 if none).
    fn latest_version(&self, lineage: &TemplateId) -> Result<u32>;

    /// Insert a merged template, optionally marking its source superseded.
    /// Nothing is written if either step fails.
    fn commit_merged_template(
        &self,
        template: &WorkflowTemplate,
        supersede: Option<&TemplateId>,
    ) -> Result<()>;

    // Instances

    /// Persist an instance together with all of its node instances.
    fn create_instance(&self, instance: &WorkflowInstance, nodes: &[NodeInstance]) -> Result<()>;

    fn get_instance(&self, id: &InstanceId) -> Result<WorkflowInstance>;

    fn list_instances(&self, template: Option<&TemplateId>) -> Result<Vec<WorkflowInstance>>;

    /// `Pending → Running`, moving every `Created` node to `Waiting`.
    fn start_instance(&self, id: &InstanceId) -> Result<bool>;

    fn transition_instance(
        &self,
        id: &InstanceId,
        from: &[InstanceStatus],
        to: InstanceStatus,
        error: Option<&str>,
    ) -> Result<bool>;

    /// Cancel an instance and all of its non-terminal nodes and open tasks.
    fn cancel_instance(&self, id: &InstanceId) -> Result<bool>;

    // Node instances

    fn get_node(&self, id: &NodeInstanceId) -> Result<NodeInstance>;

    fn find_node(&self, instance: &InstanceId, node_key: &str) -> Result<NodeInstance>;

    fn list_nodes(&self, instance: &InstanceId) -> Result<Vec<NodeInstance>>;

    /// Compare-and-set on node status, applying `patch` on success.
    fn transition_node(
        &self,
        id: &NodeInstanceId,
        from: &[NodeStatus],
        to: NodeStatus,
        patch: &NodePatch,
    ) -> Result<bool>;

    // Tasks

    /// Insert unless a task already exists for the node. Returns whether a
    /// row was written.
    fn create_task(&self, task: &TaskInstance) -> Result<bool>;

    fn get_task(&self, id: &TaskId) -> Result<TaskInstance>;

    fn task_for_node(&self, node: &NodeInstanceId) -> Result<Option<TaskInstance>>;

    fn list_tasks(&self, instance: &InstanceId) -> Result<Vec<TaskInstance>>;

    /// Close an open task and complete its node with the result as output.
    fn complete_task(&self, id: &TaskId, result: &serde_json::Value) -> Result<bool>;

    /// Fail an open task, its node, and the owning running instance.
    fn fail_task(&self, id: &TaskId, error: &str) -> Result<bool>;

    /// Reopen a failed task: node `Failed → Running`, retry count and attempt
    /// incremented, instance and owning subdivision revived.
    fn reopen_task(&self, id: &TaskId) -> Result<bool>;

    fn attach_reference_result(&self, id: &TaskId, result: &serde_json::Value) -> Result<()>;

    // Subdivisions

    /// Persist a subdivision, its freshly designed template, and its child.
    fn insert_subdivision(
        &self,
        subdivision: &Subdivision,
        template: Option<&WorkflowTemplate>,
        child: Option<NewChild<'_>>,
    ) -> Result<()>;

    fn get_subdivision(&self, id: &SubdivisionId) -> Result<Subdivision>;

    fn subdivisions_for_task(&self, task: &TaskId, active_only: bool) -> Result<Vec<Subdivision>>;

    /// All subdivisions spawned from tasks of the given instance.
    fn subdivisions_for_instance(&self, instance: &InstanceId) -> Result<Vec<Subdivision>>;

    fn transition_subdivision(
        &self,
        id: &SubdivisionId,
        from: &[SubdivisionStatus],
        to: SubdivisionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool>;
}
