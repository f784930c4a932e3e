use serde::Serialize;

use crate::types::{InstanceId, NodeInstanceId, SubdivisionId, TaskId, TemplateId};

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A template version was stored.
    TemplateCreated { template_id: TemplateId, version: u32 },
    /// An instance moved from pending to running.
    InstanceStarted { instance_id: InstanceId },
    /// A node passed its dependency check.
    NodeReady {
        instance_id: InstanceId,
        node_id: NodeInstanceId,
        node_key: String,
    },
    /// A task was created for a ready node.
    TaskCreated {
        instance_id: InstanceId,
        task_id: TaskId,
        node_key: String,
    },
    /// A ready node was claimed by its task.
    NodeStarted {
        instance_id: InstanceId,
        node_id: NodeInstanceId,
        node_key: String,
    },
    NodeCompleted {
        instance_id: InstanceId,
        node_id: NodeInstanceId,
        node_key: String,
    },
    NodeFailed {
        instance_id: InstanceId,
        node_id: NodeInstanceId,
        node_key: String,
        error: String,
    },
    NodeBlocked {
        instance_id: InstanceId,
        node_id: NodeInstanceId,
    },
    NodeResumed {
        instance_id: InstanceId,
        node_id: NodeInstanceId,
    },
    /// A failed task was reopened for another attempt.
    TaskRetried { task_id: TaskId, attempt: u32 },
    InstanceCompleted { instance_id: InstanceId },
    InstanceFailed { instance_id: InstanceId, error: String },
    InstanceCancelled { instance_id: InstanceId },
    SubdivisionCreated {
        subdivision_id: SubdivisionId,
        task_id: TaskId,
        child_instance_id: Option<InstanceId>,
    },
    /// A child instance completed; its result went to the parent task.
    SubdivisionCompleted {
        subdivision_id: SubdivisionId,
        auto_submitted: bool,
    },
    SubdivisionFailed {
        subdivision_id: SubdivisionId,
        error: String,
    },
    /// A merge produced a new template version.
    TemplateMerged {
        source: TemplateId,
        template_id: TemplateId,
        subdivisions: Vec<SubdivisionId>,
    },
}

impl EngineEvent {
    /// Verbosity tier: 1 = instance lifecycle, 2 = node transitions,
    /// 3 = task detail.
    pub fn level(&self) -> u8 {
        match self {
            Self::TemplateCreated { .. }
            | Self::InstanceStarted { .. }
            | Self::InstanceCompleted { .. }
            | Self::InstanceFailed { .. }
            | Self::InstanceCancelled { .. }
            | Self::SubdivisionCreated { .. }
            | Self::SubdivisionCompleted { .. }
            | Self::SubdivisionFailed { .. }
            | Self::TemplateMerged { .. } => 1,
            Self::NodeReady { .. }
            | Self::NodeStarted { .. }
            | Self::NodeCompleted { .. }
            | Self::NodeFailed { .. }
            | Self::NodeBlocked { .. }
            | Self::NodeResumed { .. } => 2,
            Self::TaskCreated { .. } | Self::TaskRetried { .. } => 3,
        }
    }

    /// The instance this event concerns, if any.
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            Self::InstanceStarted { instance_id }
            | Self::NodeReady { instance_id, .. }
            | Self::TaskCreated { instance_id, .. }
            | Self::NodeStarted { instance_id, .. }
            | Self::NodeCompleted { instance_id, .. }
            | Self::NodeFailed { instance_id, .. }
            | Self::NodeBlocked { instance_id, .. }
            | Self::NodeResumed { instance_id, .. }
            | Self::InstanceCompleted { instance_id }
            | Self::InstanceFailed { instance_id, .. }
            | Self::InstanceCancelled { instance_id } => Some(instance_id),
            _ => None,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::InstanceStarted {
            instance_id: InstanceId::new(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = InstanceId::new();
        bus.publish(EngineEvent::InstanceCompleted {
            instance_id: id.clone(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.instance_id(), Some(&id));
        assert_eq!(event.level(), 1);
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = EngineEvent::TaskRetried {
            task_id: TaskId::from_str("t-1"),
            attempt: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_retried");
        assert_eq!(json["task_id"], "t-1");
    }
}
