use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskweaveError {
    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // State errors
    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Retry limit reached for task {task} ({limit} retries)")]
    RetryLimit { task: String, limit: u32 },

    // Merge errors
    #[error("Merge candidate {subdivision} is incompatible: {reason}")]
    MergeIncompatible { subdivision: String, reason: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TaskweaveError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the error reports a benign status race rather than a fault.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StateConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, TaskweaveError>;
