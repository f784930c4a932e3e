//! Cascading work queue.
//!
//! Every engine entry point seeds a [`WorkQueue`] and drains it before
//! returning. Handlers push follow-up work instead of recursing, so a
//! completion deep inside a nested subdivision unwinds through a flat loop.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use taskweave_core::error::Result;
use taskweave_core::event::EngineEvent;
use taskweave_core::types::{InstanceId, InstanceStatus, NodeInstanceId, NodeStatus};

use crate::engine::Engine;
use crate::instantiator::{passthrough, TaskInstantiator};
use crate::tracker::DependencyTracker;

/// One unit of cascading work.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Work {
    /// Check whether a waiting node's dependencies are satisfied.
    Activate(NodeInstanceId),
    /// Instantiate the task of a node that just became ready.
    Instantiate(NodeInstanceId),
    /// Propagate a completed node to its downstream neighbours.
    Completed(NodeInstanceId),
    /// Cancel an instance and everything running beneath it.
    Cancel(InstanceId),
    /// An instance reached a terminal status.
    Finished(InstanceId),
}

#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    items: VecDeque<Work>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn of(work: Work) -> Self {
        let mut queue = Self::new();
        queue.push(work);
        queue
    }

    pub(crate) fn push(&mut self, work: Work) {
        self.items.push_back(work);
    }

    fn pop(&mut self) -> Option<Work> {
        self.items.pop_front()
    }
}

impl Engine {
    /// Run queued work until nothing is left.
    pub(crate) fn drain(&self, mut queue: WorkQueue) -> Result<()> {
        while let Some(work) = queue.pop() {
            debug!(?work, "Dispatching");
            match work {
                Work::Activate(id) => self.handle_activate(&id, &mut queue)?,
                Work::Instantiate(id) => self.handle_instantiate(&id, &mut queue)?,
                Work::Completed(id) => self.handle_completed(&id, &mut queue)?,
                Work::Cancel(id) => self.handle_cancel(&id, &mut queue)?,
                Work::Finished(id) => self.handle_finished(&id, &mut queue)?,
            }
        }
        Ok(())
    }

    fn handle_activate(&self, id: &NodeInstanceId, queue: &mut WorkQueue) -> Result<()> {
        if !DependencyTracker::new(self.store()).try_activate(id)? {
            return Ok(());
        }
        let node = self.store().get_node(id)?;
        self.publish(EngineEvent::NodeReady {
            instance_id: node.instance_id,
            node_id: node.id,
            node_key: node.node_key,
        });
        queue.push(Work::Instantiate(id.clone()));
        Ok(())
    }

    fn handle_instantiate(&self, id: &NodeInstanceId, queue: &mut WorkQueue) -> Result<()> {
        let Some(task) = TaskInstantiator::new(self.store()).on_node_ready(id)? else {
            return Ok(());
        };
        self.publish(EngineEvent::TaskCreated {
            instance_id: task.instance_id.clone(),
            task_id: task.id.clone(),
            node_key: task.node_key.clone(),
        });

        if task.kind.is_placeholder() && self.settings().auto_complete_placeholders {
            self.claim(&task)?;
            if self.store().complete_task(&task.id, &passthrough(&task))? {
                debug!(node_key = %task.node_key, "Placeholder completed");
                queue.push(Work::Completed(id.clone()));
            }
        }
        Ok(())
    }

    fn handle_completed(&self, id: &NodeInstanceId, queue: &mut WorkQueue) -> Result<()> {
        let node = self.store().get_node(id)?;
        self.publish(EngineEvent::NodeCompleted {
            instance_id: node.instance_id.clone(),
            node_id: node.id.clone(),
            node_key: node.node_key.clone(),
        });

        let instance = self.store().get_instance(&node.instance_id)?;
        let graph = self.store().get_template(&instance.template_id)?.graph();
        for key in graph.downstream(&node.node_key) {
            let next = self.store().find_node(&instance.id, key)?;
            queue.push(Work::Activate(next.id));
        }

        let nodes = self.store().list_nodes(&instance.id)?;
        if nodes.iter().all(|n| n.status == NodeStatus::Completed)
            && self.store().transition_instance(
                &instance.id,
                &[InstanceStatus::Running],
                InstanceStatus::Completed,
                None,
            )?
        {
            queue.push(Work::Finished(instance.id));
        }
        Ok(())
    }

    fn handle_cancel(&self, id: &InstanceId, queue: &mut WorkQueue) -> Result<()> {
        if !self.store().cancel_instance(id)? {
            debug!(instance_id = %id, "Instance already finished, nothing to cancel");
            return Ok(());
        }
        // Downward only: children are cancelled, the parent task is not.
        for sub in self.store().subdivisions_for_instance(id)? {
            if let Some(child) = sub.child_instance_id {
                queue.push(Work::Cancel(child));
            }
        }
        queue.push(Work::Finished(id.clone()));
        Ok(())
    }

    fn handle_finished(&self, id: &InstanceId, queue: &mut WorkQueue) -> Result<()> {
        let instance = self.store().get_instance(id)?;
        match instance.status {
            InstanceStatus::Completed => {
                info!(instance_id = %id, "Instance completed");
                self.publish(EngineEvent::InstanceCompleted {
                    instance_id: id.clone(),
                });
            }
            InstanceStatus::Failed => {
                let error = instance.error.clone().unwrap_or_default();
                warn!(instance_id = %id, error = %error, "Instance failed");
                self.publish(EngineEvent::InstanceFailed {
                    instance_id: id.clone(),
                    error,
                });
            }
            InstanceStatus::Cancelled => {
                info!(instance_id = %id, "Instance cancelled");
                self.publish(EngineEvent::InstanceCancelled {
                    instance_id: id.clone(),
                });
            }
            InstanceStatus::Pending | InstanceStatus::Running => return Ok(()),
        }

        if let Some(sub_id) = &instance.parent_subdivision {
            self.on_child_finished(sub_id, &instance, queue)?;
        }
        Ok(())
    }
}
