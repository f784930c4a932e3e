use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskweaveError;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_str(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, for log lines and CLI tables.
            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Identity of one stored template version.
    TemplateId
);
entity_id!(
    /// Identity of one workflow execution.
    InstanceId
);
entity_id!(
    /// Identity of a node's execution state within one instance.
    NodeInstanceId
);
entity_id!(
    /// Identity of the unit of work handed to a human or agent.
    TaskId
);
entity_id!(
    /// Identity of a task-to-child-instance link.
    SubdivisionId
);

macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = TaskweaveError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(TaskweaveError::Database(format!(
                        "unknown {} value: {}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Execution status of a node instance.
///
/// Forward order is `Created → Waiting → Ready → Running → Completed`, with
/// `Running → Failed`, `Running ⇄ Blocked`, and any non-terminal state
/// `→ Cancelled`. A failed node re-enters `Running` only through an explicit
/// retry.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Created,
    Waiting,
    Ready,
    Running,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

status_strings!(NodeStatus {
    Created => "created",
    Waiting => "waiting",
    Ready => "ready",
    Running => "running",
    Blocked => "blocked",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl NodeStatus {
    pub const ALL: [NodeStatus; 8] = [
        Self::Created,
        Self::Waiting,
        Self::Ready,
        Self::Running,
        Self::Blocked,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses that are never left again (except `Failed` via retry).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a task record must exist for a node in this status.
    pub fn has_task(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Running | Self::Blocked | Self::Completed | Self::Failed
        )
    }

    /// Whether `self → target` is a legal single transition.
    pub fn can_transition_to(&self, target: NodeStatus) -> bool {
        use NodeStatus::{Blocked, Cancelled, Completed, Created, Failed, Ready, Running, Waiting};
        match (self, target) {
            (Created, Waiting) | (Waiting, Ready) | (Ready, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Running, Blocked) | (Blocked, Running) => true,
            (Failed, Running) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Lifecycle of a workflow instance.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

status_strings!(InstanceStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of the work item presented for one node.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Completed,
    Failed,
    Cancelled,
}

status_strings!(TaskStatus {
    Open => "open",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// Status of a subdivision, tracking its child instance.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubdivisionStatus {
    /// Child created but not started.
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

status_strings!(SubdivisionStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// What kind of work a node represents.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry placeholder; completed by the engine.
    Start,
    /// Exit placeholder; completed by the engine.
    End,
    #[default]
    Human,
    Agent,
    /// Shared between a human and an agent.
    Hybrid,
    System,
}

status_strings!(NodeKind {
    Start => "start",
    End => "end",
    Human => "human",
    Agent => "agent",
    Hybrid => "hybrid",
    System => "system",
});

impl NodeKind {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Start | Self::End)
    }

    /// Only human-assignable work can be broken into a sub-workflow.
    pub fn is_decomposable(&self) -> bool {
        matches!(self, Self::Human | Self::Hybrid)
    }
}
