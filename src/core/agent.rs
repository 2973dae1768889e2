//! Worker identity, roles and the persisted agent record.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a worker.
///
/// Supervisor-spawned workers get `<role>-agent-<short uuid>`; external
/// workers may register under any non-empty name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identity for a worker of the given role.
    pub fn generate(role: Role) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("{}-agent-{}", role, &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The three worker classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Search and discovery.
    Discovery,
    /// Code generation.
    Generation,
    /// Critical review.
    Review,
}

impl Role {
    /// All roles, in routing precedence order.
    pub const ALL: [Role; 3] = [Role::Discovery, Role::Generation, Role::Review];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Discovery => "discovery",
            Role::Generation => "generation",
            Role::Review => "review",
        }
    }

    /// Built-in routing keywords for this role.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Role::Discovery => &["search", "analyze", "discover", "investigate", "find"],
            Role::Generation => &["code", "implement", "create", "fix", "refactor", "build"],
            Role::Review => &["review", "audit", "security", "validate", "assess"],
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown role '{}'", s)))
    }
}

/// Status of a worker as recorded in the agent registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Busy,
    Error,
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A worker as seen by the agent registry projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub role: Role,
    pub pid: u32,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Last task the worker reported. Only replaced by a non-null heartbeat.
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tasks_failed: u32,
}

impl Agent {
    /// A freshly registered, active worker.
    pub fn register(id: AgentId, role: Role, pid: u32) -> Self {
        Self {
            id,
            role,
            pid,
            status: AgentStatus::Active,
            last_heartbeat: Utc::now(),
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }
}
