//! Task data model for the coordination queue.
//!
//! Tasks are the units of work pulled by workers. Each task tracks its
//! routing type, priority, assignment, dependencies and final result.

use crate::core::agent::AgentId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// The lifecycle only moves forward:
/// `pending → assigned → in_progress → {completed | failed | cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for an eligible worker.
    Pending,
    /// Claimed by a worker but not started.
    Assigned,
    /// Being executed by its worker.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Withdrawn before finishing.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Terminal statuses can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the task holds a worker (claimed or running).
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Assigned => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 3,
        }
    }

    /// Whether a status update may move a task from `self` to `next`.
    ///
    /// `Assigned` is never a valid update target; it is only reachable
    /// through assignment, which also records the assignee.
    pub fn can_update_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next != TaskStatus::Assigned && next.rank() > self.rank()
    }

    /// Parse the snake_case wire name.
    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown task status '{}'", s)))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority, 1 (highest) to 3 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGH: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);

    /// Validate a raw priority value.
    pub fn new(value: u8) -> Result<Self> {
        if (1..=3).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidPriority(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task a finishing worker asks to be created next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpTask {
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Result reported by a worker when a task finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskResult {
    /// The work succeeded.
    Success {
        /// Free-form output produced by the worker.
        output: serde_json::Value,
        /// Tasks to create once this one is recorded as completed.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        next_tasks: Vec<FollowUpTask>,
    },
    /// The work failed.
    Failure {
        /// Error message describing the failure.
        error: String,
    },
}

impl TaskResult {
    /// A success result with no follow-up tasks.
    pub fn success(output: impl Into<serde_json::Value>) -> Self {
        TaskResult::Success {
            output: output.into(),
            next_tasks: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        TaskResult::Failure {
            error: error.into(),
        }
    }

    /// The success output, if any.
    pub fn output(&self) -> Option<&serde_json::Value> {
        match self {
            TaskResult::Success { output, .. } => Some(output),
            TaskResult::Failure { .. } => None,
        }
    }
}

/// A single task in the coordination queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Routing type, matched against the role table.
    #[serde(rename = "type")]
    pub task_type: String,
    /// 1 = highest, 3 = lowest.
    pub priority: Priority,
    /// The worker that claimed this task. Set exactly once.
    pub assigned_to: Option<AgentId>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Tasks that must be completed before this one can be assigned.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Position of the creating event in the log, filled in by replay.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub created_seq: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Task {
    /// Create a new pending task with a fresh id.
    pub fn new(task_type: &str, description: &str, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.to_string(),
            priority,
            assigned_to: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            description: description.to_string(),
            context: None,
            dependencies: BTreeSet::new(),
            result: None,
            created_seq: 0,
        }
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}
