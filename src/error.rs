use thiserror::Error;

use crate::core::{AgentId, TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timed out acquiring {lock} lock after {timeout:?}")]
    LockTimeout {
        lock: &'static str,
        timeout: std::time::Duration,
    },

    #[error("Event log corrupt at line {line}: {reason}")]
    LogCorrupt { line: usize, reason: String },

    #[error("Projection file unreadable: {0}")]
    ProjectionCorrupt(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Dependency does not name an existing task: {0}")]
    UnknownDependency(TaskId),

    #[error("Task type '{0}' does not route to any role")]
    Unroutable(String),

    #[error("Priority must be between 1 and 3, got {0}")]
    InvalidPriority(u8),

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),

    #[error("Worker not found: {id}")]
    WorkerNotFound { id: AgentId },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
