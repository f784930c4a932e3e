use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use taskweave_core::error::{Result, TaskweaveError};
use taskweave_core::event::EngineEvent;
use taskweave_core::instance::{Subdivision, WorkflowInstance};
use taskweave_core::template::{WorkflowDesign, WorkflowTemplate};
use taskweave_core::traits::NewChild;
use taskweave_core::types::*;

use crate::dispatch::{Work, WorkQueue};
use crate::engine::{nodes_for, Engine};

/// Where a subdivision's child workflow comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubWorkflow {
    /// A freshly drawn sub-workflow, stored as a new template.
    Design(WorkflowDesign),
    /// An already stored template version.
    Template(TemplateId),
}

/// Request to decompose one task into a child workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdivisionRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub workflow: SubWorkflow,
    /// Start the child right away instead of leaving it pending.
    #[serde(default = "default_true")]
    pub execute_immediately: bool,
    /// Submit the child's result as the parent task's result.
    #[serde(default)]
    pub auto_submit: bool,
}

fn default_true() -> bool {
    true
}

impl SubdivisionRequest {
    pub fn new(name: impl Into<String>, workflow: SubWorkflow) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            workflow,
            execute_immediately: true,
            auto_submit: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn auto_submit(mut self, auto_submit: bool) -> Self {
        self.auto_submit = auto_submit;
        self
    }

    pub fn execute_immediately(mut self, execute: bool) -> Self {
        self.execute_immediately = execute;
        self
    }
}

impl Engine {
    /// Decompose an in-flight task into an independent child instance.
    ///
    /// The task's node must be ready, running, or blocked, and its kind must
    /// allow decomposition. A ready node is claimed (`Ready → Running`). A
    /// design that fails validation is recorded as a failed subdivision
    /// without a child and the validation error is returned.
    pub fn subdivide(&self, task_id: &TaskId, request: SubdivisionRequest) -> Result<Subdivision> {
        let task = self.open_task(task_id)?;
        if !task.kind.is_decomposable() {
            return Err(TaskweaveError::Validation(format!(
                "{} task '{}' cannot be subdivided",
                task.kind, task.node_key
            )));
        }
        let node = self.store().get_node(&task.node_instance_id)?;
        if !matches!(
            node.status,
            NodeStatus::Ready | NodeStatus::Running | NodeStatus::Blocked
        ) {
            return Err(TaskweaveError::StateConflict(format!(
                "node '{}' is {}",
                node.node_key, node.status
            )));
        }

        let mut subdivision = Subdivision {
            id: SubdivisionId::new(),
            task_id: task.id.clone(),
            parent_instance_id: task.instance_id.clone(),
            parent_node_key: task.node_key.clone(),
            template_id: None,
            child_instance_id: None,
            name: request.name,
            description: request.description,
            execute_immediately: request.execute_immediately,
            auto_submit: request.auto_submit,
            status: SubdivisionStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        let (template, is_new) = match request.workflow {
            SubWorkflow::Template(id) => (self.store().get_template(&id)?, false),
            SubWorkflow::Design(design) => match WorkflowTemplate::from_design(design) {
                Ok(template) => (template, true),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Subdivision design rejected");
                    subdivision.status = SubdivisionStatus::Failed;
                    subdivision.error = Some(e.to_string());
                    subdivision.completed_at = Some(Utc::now());
                    self.store().insert_subdivision(&subdivision, None, None)?;
                    return Err(e);
                }
            },
        };

        self.claim(&task)?;

        let context = json!({
            "parent_task": task.id,
            "parent_node": task.node_key,
            "input": task.input,
        });
        let child =
            WorkflowInstance::new(template.id.clone(), context).with_parent(subdivision.id.clone());
        let child_nodes = nodes_for(&child, &template);
        subdivision.template_id = Some(template.id.clone());
        subdivision.child_instance_id = Some(child.id.clone());

        self.store().insert_subdivision(
            &subdivision,
            is_new.then_some(&template),
            Some(NewChild {
                instance: &child,
                nodes: &child_nodes,
            }),
        )?;
        info!(
            subdivision_id = %subdivision.id,
            task_id = %task.id,
            child_instance_id = %child.id,
            "Subdivision created"
        );
        self.publish(EngineEvent::SubdivisionCreated {
            subdivision_id: subdivision.id.clone(),
            task_id: task.id.clone(),
            child_instance_id: Some(child.id.clone()),
        });

        if subdivision.execute_immediately {
            self.start_subdivision(&subdivision.id)?;
        }
        self.store().get_subdivision(&subdivision.id)
    }

    /// Start the child of a pending subdivision.
    pub fn start_subdivision(&self, id: &SubdivisionId) -> Result<()> {
        let subdivision = self.store().get_subdivision(id)?;
        let child = subdivision.child_instance_id.ok_or_else(|| {
            TaskweaveError::StateConflict(format!("subdivision {} has no child instance", id))
        })?;
        if !self.store().transition_subdivision(
            id,
            &[SubdivisionStatus::Pending],
            SubdivisionStatus::Running,
            None,
            None,
        )? {
            return Err(TaskweaveError::StateConflict(format!(
                "subdivision {} is {}, not pending",
                id, subdivision.status
            )));
        }
        self.start_instance(&child)
    }

    pub fn get_subdivision(&self, id: &SubdivisionId) -> Result<Subdivision> {
        self.store().get_subdivision(id)
    }

    /// Subdivisions of a task, optionally only those that produced a child.
    pub fn subdivisions(&self, task_id: &TaskId, active_only: bool) -> Result<Vec<Subdivision>> {
        self.store().subdivisions_for_task(task_id, active_only)
    }

    /// Hand a finished child's outcome back to its subdivision.
    ///
    /// Only the subdivision changes on failure or cancellation; the parent
    /// task is touched only by an auto-submitted result.
    pub(crate) fn on_child_finished(
        &self,
        id: &SubdivisionId,
        child: &WorkflowInstance,
        queue: &mut WorkQueue,
    ) -> Result<()> {
        let subdivision = self.store().get_subdivision(id)?;
        let live = [SubdivisionStatus::Pending, SubdivisionStatus::Running];

        match child.status {
            InstanceStatus::Completed => {
                let result = self.child_result(&subdivision, child)?;
                if !self.store().transition_subdivision(
                    id,
                    &[SubdivisionStatus::Running],
                    SubdivisionStatus::Completed,
                    Some(&result),
                    None,
                )? {
                    return Ok(());
                }

                let auto_submitted = subdivision.auto_submit
                    && self.submit_to_parent(&subdivision, &result, queue)?;
                if !subdivision.auto_submit {
                    self.store().attach_reference_result(&subdivision.task_id, &result)?;
                }
                info!(subdivision_id = %id, auto_submitted, "Subdivision completed");
                self.publish(EngineEvent::SubdivisionCompleted {
                    subdivision_id: id.clone(),
                    auto_submitted,
                });
            }
            InstanceStatus::Failed => {
                let error = child.error.clone().unwrap_or_else(|| "child instance failed".into());
                if self.store().transition_subdivision(
                    id,
                    &live,
                    SubdivisionStatus::Failed,
                    None,
                    Some(&error),
                )? {
                    warn!(subdivision_id = %id, error = %error, "Subdivision failed");
                    self.publish(EngineEvent::SubdivisionFailed {
                        subdivision_id: id.clone(),
                        error,
                    });
                }
            }
            InstanceStatus::Cancelled => {
                self.store().transition_subdivision(
                    id,
                    &live,
                    SubdivisionStatus::Cancelled,
                    None,
                    Some("child instance cancelled"),
                )?;
            }
            InstanceStatus::Pending | InstanceStatus::Running => {}
        }
        Ok(())
    }

    /// Submit a child's result as the parent task's result. Returns `false`
    /// if the parent task was closed in the meantime.
    fn submit_to_parent(
        &self,
        subdivision: &Subdivision,
        result: &Value,
        queue: &mut WorkQueue,
    ) -> Result<bool> {
        let task = self.store().get_task(&subdivision.task_id)?;
        if task.status != TaskStatus::Open {
            warn!(
                subdivision_id = %subdivision.id,
                task_id = %task.id,
                status = %task.status,
                "Parent task no longer open, keeping result as reference"
            );
            self.store().attach_reference_result(&task.id, result)?;
            return Ok(false);
        }
        if !self.store().complete_task(&task.id, result)? {
            warn!(
                subdivision_id = %subdivision.id,
                task_id = %task.id,
                "Parent node cannot complete, keeping result as reference"
            );
            self.store().attach_reference_result(&task.id, result)?;
            return Ok(false);
        }
        queue.push(Work::Completed(task.node_instance_id));
        Ok(true)
    }

    /// Result payload of a completed child: the outputs of its exit nodes.
    fn child_result(&self, subdivision: &Subdivision, child: &WorkflowInstance) -> Result<Value> {
        let graph = self.store().get_template(&child.template_id)?.graph();
        let mut outputs = Map::new();
        for key in graph.exit_points() {
            let node = self.store().find_node(&child.id, &key)?;
            outputs.insert(key, node.output.unwrap_or(Value::Null));
        }
        Ok(json!({
            "subdivision": subdivision.id,
            "name": subdivision.name,
            "outputs": outputs,
        }))
    }
}
