//! Events recorded in the append-only log.
//!
//! Every mutation of coordination state is one `EventRecord`, stored as a
//! single JSON line of the form `{"id", "timestamp", "type", "data"}`.
//! Both projections are pure folds over these records.

use crate::core::agent::{Agent, AgentId};
use crate::core::task::{Task, TaskId, TaskResult, TaskStatus};
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Payload of a `task_assigned` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssigned {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
}

/// Payload of a `task_updated` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdated {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

/// Payload of an `agent_heartbeat` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub current_task: Option<TaskId>,
}

/// A state change. The wire `type` is the snake_case variant name.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TaskCreated(Task),
    TaskAssigned(TaskAssigned),
    TaskUpdated(TaskUpdated),
    AgentRegistered(Agent),
    AgentHeartbeat(Heartbeat),
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::TaskCreated(_) => "task_created",
            Event::TaskAssigned(_) => "task_assigned",
            Event::TaskUpdated(_) => "task_updated",
            Event::AgentRegistered(_) => "agent_registered",
            Event::AgentHeartbeat(_) => "agent_heartbeat",
        }
    }

    fn data(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Event::TaskCreated(task) => serde_json::to_value(task),
            Event::TaskAssigned(data) => serde_json::to_value(data),
            Event::TaskUpdated(data) => serde_json::to_value(data),
            Event::AgentRegistered(agent) => serde_json::to_value(agent),
            Event::AgentHeartbeat(data) => serde_json::to_value(data),
        }
    }

    fn from_parts(kind: &str, data: serde_json::Value) -> Result<Self, Error> {
        let event = match kind {
            "task_created" => Event::TaskCreated(serde_json::from_value(data)?),
            "task_assigned" => Event::TaskAssigned(serde_json::from_value(data)?),
            "task_updated" => Event::TaskUpdated(serde_json::from_value(data)?),
            "agent_registered" => Event::AgentRegistered(serde_json::from_value(data)?),
            "agent_heartbeat" => Event::AgentHeartbeat(serde_json::from_value(data)?),
            other => return Err(Error::UnknownEventType(other.to_string())),
        };
        Ok(event)
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRecord")]
pub struct EventRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventRecord {
    /// Wrap an event with a fresh id and the current time.
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }

    /// Encode as a single JSON line without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for EventRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.event.data().map_err(serde::ser::Error::custom)?;
        let mut record = serializer.serialize_struct("EventRecord", 4)?;
        record.serialize_field("id", &self.id)?;
        record.serialize_field("timestamp", &self.timestamp)?;
        record.serialize_field("type", self.event.type_name())?;
        record.serialize_field("data", &data)?;
        record.end()
    }
}

#[derive(Deserialize)]
struct RawRecord {
    id: Uuid,
    timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

impl TryFrom<RawRecord> for EventRecord {
    type Error = Error;

    fn try_from(raw: RawRecord) -> Result<Self, Error> {
        Ok(Self {
            id: raw.id,
            timestamp: raw.timestamp,
            event: Event::from_parts(&raw.kind, raw.data)?,
        })
    }
}
