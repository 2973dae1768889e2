//! Materialized views folded from the event log.
//!
//! `Projection::fold` is a pure function of the record sequence: the same
//! log always yields the same task and agent maps. The on-disk files add
//! only a `rebuilt_at` stamp on top of that.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Agent, AgentId, Event, EventRecord, Task, TaskId, TaskStatus};
use crate::flog_trace;

/// Contents of the task queue projection file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueFile {
    pub tasks: BTreeMap<TaskId, Task>,
    pub version: u64,
    pub rebuilt_at: DateTime<Utc>,
}

/// Contents of the agent registry projection file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistryFile {
    pub agents: BTreeMap<AgentId, Agent>,
    pub version: u64,
    pub rebuilt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub tasks: BTreeMap<TaskId, Task>,
    pub agents: BTreeMap<AgentId, Agent>,
    /// Number of records folded.
    pub version: u64,
}

impl Projection {
    pub fn fold<'a>(records: impl IntoIterator<Item = &'a EventRecord>) -> Self {
        let mut projection = Self::default();
        for record in records {
            projection.apply(record);
        }
        projection
    }

    /// Fold one record. Records that do not apply (unknown ids, stale
    /// transitions) are ignored but still counted.
    pub fn apply(&mut self, record: &EventRecord) {
        self.version += 1;
        match &record.event {
            Event::TaskCreated(task) => {
                let seq = self.version;
                self.tasks.entry(task.id).or_insert_with(|| Task {
                    created_seq: seq,
                    ..task.clone()
                });
            }
            Event::TaskAssigned(assigned) => {
                if let Some(task) = self.tasks.get_mut(&assigned.task_id) {
                    if task.is_pending() {
                        task.assigned_to = Some(assigned.agent_id.clone());
                        task.status = TaskStatus::Assigned;
                        task.updated_at = assigned.timestamp;
                    }
                }
            }
            Event::TaskUpdated(update) => {
                let Some(task) = self.tasks.get_mut(&update.task_id) else {
                    return;
                };
                if !task.status.can_update_to(update.status) {
                    flog_trace!(
                        "projection: ignoring {} -> {} for {}",
                        task.status,
                        update.status,
                        task.id.short()
                    );
                    return;
                }
                task.status = update.status;
                task.updated_at = update.timestamp;
                if let Some(result) = &update.result {
                    task.result = Some(result.clone());
                }
                if let Some(agent) = update.agent_id.as_ref().and_then(|id| self.agents.get_mut(id)) {
                    match update.status {
                        TaskStatus::Completed => agent.tasks_completed += 1,
                        TaskStatus::Failed => agent.tasks_failed += 1,
                        _ => {}
                    }
                }
            }
            Event::AgentRegistered(agent) => {
                self.agents.insert(agent.id.clone(), agent.clone());
            }
            Event::AgentHeartbeat(beat) => {
                if let Some(agent) = self.agents.get_mut(&beat.agent_id) {
                    agent.last_heartbeat = beat.timestamp;
                    if let Some(task) = beat.current_task {
                        agent.current_task = Some(task);
                    }
                }
            }
        }
    }

    pub fn task_queue_file(&self, rebuilt_at: DateTime<Utc>) -> TaskQueueFile {
        TaskQueueFile {
            tasks: self.tasks.clone(),
            version: self.version,
            rebuilt_at,
        }
    }

    pub fn agent_registry_file(&self, rebuilt_at: DateTime<Utc>) -> AgentRegistryFile {
        AgentRegistryFile {
            agents: self.agents.clone(),
            version: self.version,
            rebuilt_at,
        }
    }
}
