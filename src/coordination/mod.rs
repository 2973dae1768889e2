//! Task and agent lifecycle operations over the coordination store.
//!
//! The `Coordinator` is the only API the supervisor and workers use; it
//! never exposes the event log or locks directly. Expected outcomes such
//! as lock contention or a task that is no longer pending come back as
//! [`Assignment`] / [`Update`] values, while I/O failures and log
//! corruption propagate as errors.

pub mod router;

use std::collections::BTreeMap;

use chrono::Utc;

use crate::config::Config;
use crate::core::{
    Agent, AgentId, Event, Heartbeat, Priority, Role, Task, TaskAssigned, TaskId, TaskResult,
    TaskStatus, TaskUpdated,
};
use crate::store::{LockClass, Store};
use crate::{flog, flog_debug, flog_warn, Error, Result};

pub use router::Router;

/// Why an operation was refused without appending anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    UnknownTask,
    UnknownAgent,
    NotPending(TaskStatus),
    DependencyUnsatisfied(TaskId),
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    LockTimeout(&'static str),
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::UnknownTask => write!(f, "task not found"),
            Refusal::UnknownAgent => write!(f, "agent not registered"),
            Refusal::NotPending(status) => write!(f, "task is {}, not pending", status),
            Refusal::DependencyUnsatisfied(dep) => {
                write!(f, "dependency {} is not completed", dep.short())
            }
            Refusal::InvalidTransition { from, to } => {
                write!(f, "cannot move task from {} to {}", from, to)
            }
            Refusal::LockTimeout(lock) => write!(f, "timed out waiting for {} lock", lock),
        }
    }
}

/// Outcome of [`Coordinator::assign_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Assigned,
    Refused(Refusal),
}

impl Assignment {
    pub fn is_assigned(&self) -> bool {
        matches!(self, Assignment::Assigned)
    }
}

/// Outcome of status updates, registrations and heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Applied,
    Refused(Refusal),
}

impl Update {
    pub fn is_applied(&self) -> bool {
        matches!(self, Update::Applied)
    }
}

/// Parameters for [`Coordinator::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub description: String,
    pub priority: u8,
    pub context: Option<String>,
    pub dependencies: Vec<TaskId>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            priority: Priority::NORMAL.value(),
            context: None,
            dependencies: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// Task counts by status plus pending counts by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// A task eligible for several roles is counted under each.
    pub pending_by_role: BTreeMap<Role, usize>,
    pub agents: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.in_progress + self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    store: Store,
    router: Router,
}

impl Coordinator {
    pub fn new(store: Store, router: Router) -> Self {
        Self { store, router }
    }

    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(Store::from_config(config)?, Router::new(&config.routing)))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Create a pending task and return its id.
    ///
    /// Fails with `Unroutable`, `InvalidPriority` or `UnknownDependency`
    /// before anything is appended. Dependencies must already exist, so a
    /// dependency cycle can never be formed.
    pub fn create_task(&self, new: NewTask) -> Result<TaskId> {
        if !self.router.is_routable(&new.task_type) {
            return Err(Error::Unroutable(new.task_type));
        }
        let priority = Priority::new(new.priority)?;
        if !new.dependencies.is_empty() {
            let tasks = self.store.read_tasks()?;
            if let Some(missing) = new.dependencies.iter().find(|id| !tasks.contains_key(*id)) {
                return Err(Error::UnknownDependency(*missing));
            }
        }

        let task = Task::new(&new.task_type, &new.description, priority)
            .with_context(new.context)
            .with_dependencies(new.dependencies);
        let id = task.id;
        let task_type = task.task_type.clone();

        self.store
            .commit(Event::TaskCreated(task))?
            .ok_or(Error::LockTimeout {
                lock: LockClass::LogAppend.name(),
                timeout: self.store.locks().timeout(),
            })?;
        flog!("coordination: created task {} type={} priority={}", id.short(), task_type, priority);
        Ok(id)
    }

    /// Claim a pending task for `agent_id`.
    ///
    /// The check and the append happen inside the `task_assignment` lock, so
    /// of two racing callers exactly one is assigned.
    pub fn assign_task(&self, task_id: TaskId, agent_id: &AgentId) -> Result<Assignment> {
        let Some(_guard) = self.store.locks().try_acquire(LockClass::TaskAssign)? else {
            return Ok(Assignment::Refused(Refusal::LockTimeout(
                LockClass::TaskAssign.name(),
            )));
        };

        let tasks = self.store.read_tasks()?;
        let Some(task) = tasks.get(&task_id) else {
            return Ok(Assignment::Refused(Refusal::UnknownTask));
        };
        if !task.is_pending() {
            return Ok(Assignment::Refused(Refusal::NotPending(task.status)));
        }
        if let Some(dep) = task
            .dependencies
            .iter()
            .find(|dep| tasks.get(*dep).map(|t| t.status) != Some(TaskStatus::Completed))
        {
            flog_debug!(
                "coordination: {} waits on dependency {}",
                task_id.short(),
                dep.short()
            );
            return Ok(Assignment::Refused(Refusal::DependencyUnsatisfied(*dep)));
        }

        let event = Event::TaskAssigned(TaskAssigned {
            task_id,
            agent_id: agent_id.clone(),
            timestamp: Utc::now(),
        });
        let Some(projection) = self.store.commit(event)? else {
            return Ok(Assignment::Refused(Refusal::LockTimeout(
                LockClass::LogAppend.name(),
            )));
        };

        // An update from another operation class may have landed between
        // the check and the append; the fold decides.
        match projection.tasks.get(&task_id) {
            Some(task) if task.assigned_to.as_ref() == Some(agent_id) => {
                flog!("coordination: assigned {} to {}", task_id.short(), agent_id);
                Ok(Assignment::Assigned)
            }
            Some(task) => Ok(Assignment::Refused(Refusal::NotPending(task.status))),
            None => Ok(Assignment::Refused(Refusal::UnknownTask)),
        }
    }

    /// Move a task forward in its lifecycle, optionally recording a result
    /// and the reporting agent.
    pub fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<TaskResult>,
        agent_id: Option<AgentId>,
    ) -> Result<Update> {
        let Some(_guard) = self.store.locks().try_acquire(LockClass::TaskUpdate)? else {
            return Ok(Update::Refused(Refusal::LockTimeout(LockClass::TaskUpdate.name())));
        };

        let tasks = self.store.read_tasks()?;
        let Some(task) = tasks.get(&task_id) else {
            return Ok(Update::Refused(Refusal::UnknownTask));
        };
        if !task.status.can_update_to(status) {
            flog_warn!(
                "coordination: refused {} -> {} for {}",
                task.status,
                status,
                task_id.short()
            );
            return Ok(Update::Refused(Refusal::InvalidTransition {
                from: task.status,
                to: status,
            }));
        }

        let event = Event::TaskUpdated(TaskUpdated {
            task_id,
            status,
            timestamp: Utc::now(),
            agent_id,
            result,
        });
        match self.store.commit(event)? {
            Some(projection) => match projection.tasks.get(&task_id) {
                Some(task) if task.status == status => {
                    flog!("coordination: task {} is now {}", task_id.short(), status);
                    Ok(Update::Applied)
                }
                Some(task) => Ok(Update::Refused(Refusal::InvalidTransition {
                    from: task.status,
                    to: status,
                })),
                None => Ok(Update::Refused(Refusal::UnknownTask)),
            },
            None => Ok(Update::Refused(Refusal::LockTimeout(LockClass::LogAppend.name()))),
        }
    }

    /// Record a worker. Registering an existing id replaces its record.
    pub fn register_agent(&self, agent_id: &AgentId, role: Role, pid: u32) -> Result<Update> {
        let Some(_guard) = self.store.locks().try_acquire(LockClass::AgentRegistry)? else {
            return Ok(Update::Refused(Refusal::LockTimeout(
                LockClass::AgentRegistry.name(),
            )));
        };
        let agent = Agent::register(agent_id.clone(), role, pid);
        match self.store.commit(Event::AgentRegistered(agent))? {
            Some(_) => {
                flog!("coordination: registered {} as {} (pid {})", agent_id, role, pid);
                Ok(Update::Applied)
            }
            None => Ok(Update::Refused(Refusal::LockTimeout(LockClass::LogAppend.name()))),
        }
    }

    /// Record a liveness signal. `current_task` only overwrites the
    /// registry's value when present.
    pub fn heartbeat(&self, agent_id: &AgentId, current_task: Option<TaskId>) -> Result<Update> {
        let Some(_guard) = self.store.locks().try_acquire(LockClass::AgentRegistry)? else {
            return Ok(Update::Refused(Refusal::LockTimeout(
                LockClass::AgentRegistry.name(),
            )));
        };
        if !self.store.read_agents()?.contains_key(agent_id) {
            return Ok(Update::Refused(Refusal::UnknownAgent));
        }
        let event = Event::AgentHeartbeat(Heartbeat {
            agent_id: agent_id.clone(),
            timestamp: Utc::now(),
            current_task,
        });
        match self.store.commit(event)? {
            Some(_) => Ok(Update::Applied),
            None => Ok(Update::Refused(Refusal::LockTimeout(LockClass::LogAppend.name()))),
        }
    }

    /// Pending tasks routed to `role`, by priority then creation order.
    ///
    /// This is an unlocked read and may trail an in-flight append; callers
    /// must treat `assign_task` as the authority.
    pub fn available_tasks(&self, role: Role) -> Result<Vec<Task>> {
        let tasks = self.store.read_tasks()?;
        Ok(self.router.eligible(tasks.values(), role))
    }

    /// Like [`Coordinator::available_tasks`], restricted to tasks whose
    /// dependencies are all completed.
    pub fn ready_tasks(&self, role: Role) -> Result<Vec<Task>> {
        let tasks = self.store.read_tasks()?;
        Ok(self
            .router
            .eligible(tasks.values(), role)
            .into_iter()
            .filter(|task| {
                task.dependencies
                    .iter()
                    .all(|dep| tasks.get(dep).map(|t| t.status) == Some(TaskStatus::Completed))
            })
            .collect())
    }

    pub fn task(&self, task_id: TaskId) -> Result<Option<Task>> {
        Ok(self.store.read_tasks()?.remove(&task_id))
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.store.read_tasks()?.into_values().collect();
        tasks.sort_by_key(|task| task.created_seq);
        Ok(tasks)
    }

    pub fn agent(&self, agent_id: &AgentId) -> Result<Option<Agent>> {
        Ok(self.store.read_agents()?.remove(agent_id))
    }

    pub fn agents(&self) -> Result<Vec<Agent>> {
        Ok(self.store.read_agents()?.into_values().collect())
    }

    /// Stored result of a completed task; `None` for any other status.
    pub fn dependency_result(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        Ok(self
            .task(task_id)?
            .filter(|task| task.status == TaskStatus::Completed)
            .and_then(|task| task.result))
    }

    /// Rebuild both projections from the log. `false` if the `event_log`
    /// lock stayed contended.
    pub fn repair_state(&self) -> Result<bool> {
        let repaired = self.store.repair()?;
        if let Some(projection) = &repaired {
            flog!(
                "coordination: repaired state ({} tasks, {} agents, version {})",
                projection.tasks.len(),
                projection.agents.len(),
                projection.version
            );
        }
        Ok(repaired.is_some())
    }

    pub fn is_healthy(&self) -> bool {
        self.store.projections_healthy()
    }

    pub fn summary(&self) -> Result<Summary> {
        let tasks = self.store.read_tasks()?;
        let mut summary = Summary {
            agents: self.store.read_agents()?.len(),
            pending_by_role: Role::ALL.into_iter().map(|role| (role, 0)).collect(),
            ..Summary::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => {
                    summary.pending += 1;
                    for role in self.router.roles(&task.task_type) {
                        *summary.pending_by_role.entry(role).or_default() += 1;
                    }
                }
                TaskStatus::Assigned => summary.assigned += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        Ok(summary)
    }
}
