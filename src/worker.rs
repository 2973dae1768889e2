//! Worker-side client for the coordination store.
//!
//! A worker process registers itself, heartbeats, claims tasks routed to its
//! role, and reports each one as completed or failed. Identity comes from
//! the environment the supervisor's launcher sets up.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::coordination::{Assignment, Coordinator, NewTask, Router, Update};
use crate::core::{AgentId, FollowUpTask, Role, Task, TaskId, TaskResult, TaskStatus};
use crate::orchestration::launcher::{
    ENV_AGENT_ID, ENV_AGENT_ROLE, ENV_COORDINATION_PATH, ENV_PROFILE, ENV_WORKSPACE,
};
use crate::store::Store;
use crate::util::poll_until;
use crate::{flog, flog_debug, flog_error, flog_warn, Error, Result};

pub const ENV_TASK_ID: &str = "FLEET_TASK_ID";
pub const ENV_TASK_TYPE: &str = "FLEET_TASK_TYPE";
pub const ENV_TASK_DESCRIPTION: &str = "FLEET_TASK_DESCRIPTION";
pub const ENV_TASK_CONTEXT: &str = "FLEET_TASK_CONTEXT";

/// Attempts at creating one follow-up while the `event_log` lock is
/// contended, with doubling backoff starting at `FOLLOW_UP_BACKOFF`.
const FOLLOW_UP_ATTEMPTS: u32 = 3;
const FOLLOW_UP_BACKOFF: Duration = Duration::from_millis(50);

/// Who this worker is, as handed down by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub agent_id: AgentId,
    pub role: Role,
    pub store_root: PathBuf,
    pub workspace: Option<PathBuf>,
    pub profile: Option<String>,
}

impl WorkerIdentity {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the identity from any key lookup. Agent id, role and
    /// coordination path are required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Validation(format!("{} is not set", key)))
        };
        Ok(Self {
            agent_id: AgentId::new(require(ENV_AGENT_ID)?),
            role: require(ENV_AGENT_ROLE)?.parse()?,
            store_root: PathBuf::from(require(ENV_COORDINATION_PATH)?),
            workspace: lookup(ENV_WORKSPACE).map(PathBuf::from),
            profile: lookup(ENV_PROFILE),
        })
    }

    /// Open the store this worker was pointed at, using lock timing and
    /// routing from `config`.
    pub fn coordinator(&self, config: &Config) -> Result<Coordinator> {
        let store = Store::open(
            &self.store_root,
            config.lock_timeout(),
            config.lock_poll_interval(),
        )?;
        Ok(Coordinator::new(store, Router::new(&config.routing)))
    }
}

/// Outcome of [`WorkerClient::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub update: Update,
    /// Follow-up tasks created, each depending on the completed task.
    pub follow_ups: Vec<TaskId>,
    /// Follow-ups that could not be created, with the reason.
    pub rejected: Vec<(FollowUpTask, String)>,
}

/// Runs the actual work for a claimed task.
pub trait TaskExecutor {
    /// A returned `Err` or [`TaskResult::Failure`] fails the task.
    fn execute(&self, task: &Task, client: &WorkerClient) -> Result<TaskResult>;
}

/// Limits for [`WorkerClient::work`].
#[derive(Debug, Clone)]
pub struct WorkOptions {
    /// Stop after this many tasks. `None` runs until idle.
    pub max_tasks: Option<usize>,
    /// Stop after this many consecutive polls without work. `None` polls
    /// forever.
    pub idle_polls: Option<usize>,
    pub poll_interval: Duration,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            max_tasks: None,
            idle_polls: Some(1),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkReport {
    pub completed: usize,
    pub failed: usize,
}

impl WorkReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

#[derive(Debug, Clone)]
pub struct WorkerClient {
    coordinator: Coordinator,
    agent_id: AgentId,
    role: Role,
}

impl WorkerClient {
    pub fn new(coordinator: Coordinator, agent_id: AgentId, role: Role) -> Self {
        Self {
            coordinator,
            agent_id,
            role,
        }
    }

    pub fn from_identity(identity: &WorkerIdentity, config: &Config) -> Result<Self> {
        Ok(Self::new(
            identity.coordinator(config)?,
            identity.agent_id.clone(),
            identity.role,
        ))
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn register(&self, pid: u32) -> Result<Update> {
        self.coordinator.register_agent(&self.agent_id, self.role, pid)
    }

    pub fn heartbeat(&self, current_task: Option<TaskId>) -> Result<Update> {
        self.coordinator.heartbeat(&self.agent_id, current_task)
    }

    /// Pending tasks for this worker's role.
    pub fn check_tasks(&self) -> Result<Vec<Task>> {
        self.coordinator.available_tasks(self.role)
    }

    /// Assign `task_id` to this worker and report it as the current task.
    pub fn claim(&self, task_id: TaskId) -> Result<Assignment> {
        let assignment = self.coordinator.assign_task(task_id, &self.agent_id)?;
        if assignment.is_assigned() {
            if let Update::Refused(reason) = self.heartbeat(Some(task_id))? {
                flog_warn!("worker {}: heartbeat after claim refused: {}", self.agent_id, reason);
            }
        }
        Ok(assignment)
    }

    pub fn start(&self, task_id: TaskId) -> Result<Update> {
        self.report(task_id, TaskStatus::InProgress, None)
    }

    /// Mark `task_id` completed and create any follow-up tasks it lists.
    ///
    /// Follow-ups are only created once the completion is applied. Lock
    /// contention is retried with backoff; follow-ups that still cannot be
    /// created come back in [`Completion::rejected`].
    pub fn complete(&self, task_id: TaskId, result: TaskResult) -> Result<Completion> {
        let next_tasks = match &result {
            TaskResult::Success { next_tasks, .. } => next_tasks.clone(),
            TaskResult::Failure { .. } => Vec::new(),
        };
        let update = self.report(task_id, TaskStatus::Completed, Some(result))?;

        let mut completion = Completion {
            update,
            follow_ups: Vec::new(),
            rejected: Vec::new(),
        };
        if !completion.update.is_applied() {
            return Ok(completion);
        }
        for next in next_tasks {
            match self.create_follow_up(task_id, &next) {
                Ok(id) => completion.follow_ups.push(id),
                Err(e) => {
                    flog_warn!(
                        "worker {}: follow-up {} of {} not created: {}",
                        self.agent_id,
                        next.task_type,
                        task_id.short(),
                        e
                    );
                    completion.rejected.push((next, e.to_string()));
                }
            }
        }
        Ok(completion)
    }

    fn create_follow_up(&self, parent: TaskId, next: &FollowUpTask) -> Result<TaskId> {
        let new = NewTask::new(next.task_type.clone(), next.description.clone())
            .priority(next.priority.value())
            .depends_on(parent);
        let mut backoff = FOLLOW_UP_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.coordinator.create_task(new.clone()) {
                Err(Error::LockTimeout { lock, .. }) if attempt < FOLLOW_UP_ATTEMPTS => {
                    flog_debug!(
                        "worker {}: {} lock busy creating follow-up, retry {} in {:?}",
                        self.agent_id,
                        lock,
                        attempt,
                        backoff
                    );
                    thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub fn fail(&self, task_id: TaskId, error: impl Into<String>) -> Result<Update> {
        self.report(task_id, TaskStatus::Failed, Some(TaskResult::failure(error)))
    }

    pub fn dependency_result(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        self.coordinator.dependency_result(task_id)
    }

    /// Block until `task_id` completes and return its result. Fails with
    /// `Timeout` if it is still unfinished after `timeout`, and with
    /// `InvalidTransition` if it ended without completing.
    pub fn wait_for_dependency(
        &self,
        task_id: TaskId,
        timeout: Duration,
        interval: Duration,
    ) -> Result<TaskResult> {
        let result = poll_until(timeout, interval, || {
            let task = self
                .coordinator
                .task(task_id)?
                .ok_or(Error::UnknownTask(task_id))?;
            match task.status {
                TaskStatus::Completed => Ok(Some(
                    task.result
                        .unwrap_or_else(|| TaskResult::success(serde_json::Value::Null)),
                )),
                status if status.is_terminal() => Err(Error::InvalidTransition {
                    from: status,
                    to: TaskStatus::Completed,
                }),
                _ => Ok(None),
            }
        })?;
        result.ok_or(Error::Timeout(timeout))
    }

    /// Results of every completed dependency of `task`.
    pub fn dependency_results(&self, task: &Task) -> Result<BTreeMap<TaskId, TaskResult>> {
        let mut results = BTreeMap::new();
        for dep in &task.dependencies {
            if let Some(result) = self.dependency_result(*dep)? {
                results.insert(*dep, result);
            }
        }
        Ok(results)
    }

    fn report(&self, task_id: TaskId, status: TaskStatus, result: Option<TaskResult>) -> Result<Update> {
        self.coordinator
            .update_task_status(task_id, status, result, Some(self.agent_id.clone()))
    }

    /// The next task to work on: one already assigned to this worker (by
    /// the supervisor), else the first ready task this worker can claim.
    pub fn next_task(&self) -> Result<Option<Task>> {
        let assigned = self.coordinator.tasks()?.into_iter().find(|task| {
            task.status == TaskStatus::Assigned && task.assigned_to.as_ref() == Some(&self.agent_id)
        });
        if let Some(task) = assigned {
            return Ok(Some(task));
        }

        for task in self.coordinator.ready_tasks(self.role)? {
            match self.claim(task.id)? {
                Assignment::Assigned => return Ok(Some(task)),
                Assignment::Refused(reason) => {
                    flog_debug!("worker {}: lost {}: {}", self.agent_id, task.id.short(), reason)
                }
            }
        }
        Ok(None)
    }

    /// Start, execute and report one task. Returns whether it completed.
    pub fn run_task(&self, task: &Task, executor: &dyn TaskExecutor) -> Result<bool> {
        if let Update::Refused(reason) = self.start(task.id)? {
            flog_warn!("worker {}: cannot start {}: {}", self.agent_id, task.id.short(), reason);
            return Ok(false);
        }
        flog!("worker {}: running {} {}", self.agent_id, task.task_type, task.id.short());

        let outcome = executor.execute(task, self);
        let completed = match outcome {
            Ok(result @ TaskResult::Success { .. }) => {
                let completion = self.complete(task.id, result)?;
                completion.update.is_applied()
            }
            Ok(TaskResult::Failure { error }) => {
                self.fail(task.id, error)?;
                false
            }
            Err(e) => {
                flog_error!("worker {}: {} failed: {}", self.agent_id, task.id.short(), e);
                self.fail(task.id, e.to_string())?;
                false
            }
        };
        if let Update::Refused(reason) = self.heartbeat(None)? {
            flog_warn!("worker {}: heartbeat refused: {}", self.agent_id, reason);
        }
        Ok(completed)
    }

    /// Poll for work and run tasks until `options` says stop.
    pub fn work(&self, executor: &dyn TaskExecutor, options: &WorkOptions) -> Result<WorkReport> {
        let mut report = WorkReport::default();
        let mut idle = 0;
        loop {
            if options.max_tasks.is_some_and(|max| report.total() >= max) {
                break;
            }
            self.heartbeat(None)?;
            match self.next_task()? {
                Some(task) => {
                    idle = 0;
                    if self.run_task(&task, executor)? {
                        report.completed += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                None => {
                    idle += 1;
                    if options.idle_polls.is_some_and(|limit| idle >= limit) {
                        break;
                    }
                    thread::sleep(options.poll_interval);
                }
            }
        }
        flog!(
            "worker {}: done, {} completed, {} failed",
            self.agent_id,
            report.completed,
            report.failed
        );
        Ok(report)
    }
}

/// Runs a shell command per task.
///
/// The command sees the task through `FLEET_TASK_*` variables. Its stdout
/// becomes the output; stdout that parses as a task result (for example
/// one listing `next_tasks`) is used as-is. A non-zero exit fails the task.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    pub command: String,
    pub heartbeat_interval: Duration,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    pub fn heartbeat_every(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

impl TaskExecutor for ShellExecutor {
    fn execute(&self, task: &Task, client: &WorkerClient) -> Result<TaskResult> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .env(ENV_TASK_ID, task.id.to_string())
            .env(ENV_TASK_TYPE, &task.task_type)
            .env(ENV_TASK_DESCRIPTION, &task.description)
            .env(ENV_TASK_CONTEXT, task.context.as_deref().unwrap_or(""))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let output = thread::scope(|scope| {
            scope.spawn(move || loop {
                match done_rx.recv_timeout(self.heartbeat_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = client.heartbeat(Some(task.id)) {
                            flog_warn!("worker {}: heartbeat failed: {}", client.agent_id(), e);
                        }
                    }
                    _ => break,
                }
            });
            let output = run_captured(&mut command);
            drop(done_tx);
            output
        })?;

        if !output.status.success() {
            let stderr = output.stderr.trim();
            return Ok(TaskResult::failure(if stderr.is_empty() {
                format!("command exited with {}", output.status)
            } else {
                stderr.to_string()
            }));
        }
        let stdout = output.stdout.trim();
        Ok(serde_json::from_str::<TaskResult>(stdout)
            .unwrap_or_else(|_| TaskResult::success(stdout)))
    }
}

struct Captured {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
}

fn run_captured(command: &mut Command) -> Result<Captured> {
    let mut child = command.spawn()?;
    let mut stderr_pipe = child.stderr.take();
    let stderr_reader = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });
    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout)?;
    }
    let status = child.wait()?;
    let stderr = stderr_reader.join().unwrap_or_default();
    Ok(Captured {
        status,
        stdout,
        stderr,
    })
}
