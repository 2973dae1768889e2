use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use fleet::config::Config;
use fleet::coordination::{Assignment, Coordinator, NewTask, Refusal, Update};
use fleet::core::{TaskId, TaskResult, TaskStatus};
use fleet::orchestration::{ProcessLauncher, Supervisor, SupervisorStatus};
use fleet::worker::{ShellExecutor, WorkOptions, WorkerClient, WorkerIdentity};
use fleet::{flog, flog_error, Error, Result};

/// Fleet - filesystem-coordinated task queue and worker supervisor
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FLEET_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.fleet/fleet.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.fleet/fleet.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Supervise workers until interrupted
    Run,

    /// Create a task
    Task {
        /// Task type, used for routing (e.g. search, implement, review)
        task_type: String,

        description: String,

        /// 1 (highest) to 3 (lowest)
        #[arg(short = 'p', long, default_value_t = 2)]
        priority: u8,

        #[arg(long)]
        context: Option<String>,

        /// Task that must complete first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<TaskId>,
    },

    /// Show task and worker counts
    Status,

    /// List tasks in creation order
    Tasks {
        /// Only tasks with this status
        #[arg(long)]
        status: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List registered agents
    Agents,

    /// Rebuild the task queue and agent registry from the event log
    Repair,

    /// Worker-side operations; identity comes from FLEET_* variables
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum WorkerAction {
    /// Register this worker
    Register {
        /// Worker pid (defaults to the calling process)
        #[arg(long)]
        pid: Option<u32>,
    },

    /// Report liveness
    Heartbeat {
        /// Task currently being worked on
        #[arg(long)]
        task: Option<TaskId>,
    },

    /// List pending tasks for this worker's role
    Tasks,

    /// Claim a pending task
    Claim { task_id: TaskId },

    /// Mark a claimed task in progress
    Start { task_id: TaskId },

    /// Mark a task completed
    Complete {
        task_id: TaskId,

        /// Plain output text
        #[arg(long, conflicts_with = "result")]
        output: Option<String>,

        /// Full result as JSON, e.g. with next_tasks
        #[arg(long)]
        result: Option<String>,
    },

    /// Mark a task failed
    Fail { task_id: TaskId, error: String },

    /// Print the result of a completed task
    Dependency {
        task_id: TaskId,

        /// Wait up to this many seconds for the task to complete
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Claim and run tasks with a shell command until idle
    Work {
        /// Shell command run per task
        #[arg(long)]
        exec: String,

        #[arg(long)]
        max_tasks: Option<usize>,

        /// Stop after this many empty polls (0 polls forever)
        #[arg(long, default_value_t = 0)]
        idle_polls: usize,

        #[arg(long, default_value_t = 5)]
        poll_secs: u64,

        #[arg(long, default_value_t = 15)]
        heartbeat_secs: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    fleet::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let result = match cli.command {
        Command::Run => run_supervisor(config),
        Command::Task {
            task_type,
            description,
            priority,
            context,
            depends_on,
        } => run_create_task(&config, task_type, description, priority, context, depends_on),
        Command::Status => run_status(&config),
        Command::Tasks { status, json } => run_list_tasks(&config, status, json),
        Command::Agents => run_list_agents(&config),
        Command::Repair => run_repair(&config),
        Command::Worker { action } => run_worker(&config, action),
    };
    if let Err(e) = &result {
        flog_error!("fleet: {}", e);
    }
    result
}

fn open_coordinator(config: &Config) -> Result<Coordinator> {
    config.ensure_dirs()?;
    Coordinator::open(config)
}

/// Start the supervisor and keep it running until Ctrl-C or SIGTERM.
fn run_supervisor(config: Config) -> Result<()> {
    flog!("Run command: store={}", config.store_dir()?.display());
    let coordinator = open_coordinator(&config)?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let supervisor = Supervisor::new(config, coordinator, Arc::new(ProcessLauncher));
        supervisor.start().await?;
        println!("fleet supervising; press Ctrl-C to stop");

        wait_for_shutdown_signal().await?;
        supervisor.shutdown().await;
        print_status(&supervisor.status().await?);
        Ok::<(), Error>(())
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn run_create_task(
    config: &Config,
    task_type: String,
    description: String,
    priority: u8,
    context: Option<String>,
    depends_on: Vec<TaskId>,
) -> Result<()> {
    let coordinator = open_coordinator(config)?;
    let mut new = NewTask::new(task_type, description).priority(priority);
    if let Some(context) = context {
        new = new.context(context);
    }
    for dep in depends_on {
        new = new.depends_on(dep);
    }
    let id = coordinator.create_task(new)?;
    println!("{}", id);
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    let coordinator = open_coordinator(config)?;
    let summary = coordinator.summary()?;

    println!("Tasks: {} total", summary.total());
    println!("  pending:     {}", summary.pending);
    println!("  assigned:    {}", summary.assigned);
    println!("  in progress: {}", summary.in_progress);
    println!("  completed:   {}", summary.completed);
    println!("  failed:      {}", summary.failed);
    println!("  cancelled:   {}", summary.cancelled);
    println!();
    println!("Pending by role:");
    for (role, pending) in &summary.pending_by_role {
        println!("  {:<11} {}", role.as_str(), pending);
    }
    println!();
    println!("Agents registered: {}", summary.agents);
    println!(
        "Coordination state: {}",
        if coordinator.is_healthy() { "healthy" } else { "needs repair" }
    );
    Ok(())
}

fn print_status(status: &SupervisorStatus) {
    println!();
    println!("{:<11} {:>5} {:>8} {:>5} {:>8} {:>4} {:>8}", "ROLE", "LIVE", "RUNNING", "BUSY", "STOPPED", "MAX", "PENDING");
    for (role, counts) in &status.roles {
        println!(
            "{:<11} {:>5} {:>8} {:>5} {:>8} {:>4} {:>8}",
            role.as_str(),
            counts.live,
            counts.running,
            counts.busy,
            counts.stopped,
            counts.max_workers,
            counts.pending
        );
    }
    for worker in status.workers.iter().filter(|w| w.restart_count > 0) {
        println!(
            "  {} {} after {} restarts",
            worker.agent_id, worker.status, worker.restart_count
        );
    }
}

fn run_list_tasks(config: &Config, status: Option<String>, json: bool) -> Result<()> {
    let coordinator = open_coordinator(config)?;
    let filter = status.as_deref().map(TaskStatus::parse).transpose()?;
    let tasks: Vec<_> = coordinator
        .tasks()?
        .into_iter()
        .filter(|task| filter.map_or(true, |s| task.status == s))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }
    println!("{:<8} {:<11} {:<3} {:<20} {}", "ID", "STATUS", "PRI", "ASSIGNED", "TYPE: DESCRIPTION");
    for task in tasks {
        println!(
            "{:<8} {:<11} {:<3} {:<20} {}: {}",
            task.id.short(),
            task.status.as_str(),
            task.priority,
            task.assigned_to.as_ref().map_or("-", |a| a.as_str()),
            task.task_type,
            task.description
        );
    }
    Ok(())
}

fn run_list_agents(config: &Config) -> Result<()> {
    let coordinator = open_coordinator(config)?;
    let agents = coordinator.agents()?;
    if agents.is_empty() {
        println!("No agents registered");
        return Ok(());
    }
    println!("{:<28} {:<11} {:>7} {:>5} {:>5} {}", "AGENT", "ROLE", "PID", "DONE", "FAIL", "LAST HEARTBEAT");
    for agent in agents {
        println!(
            "{:<28} {:<11} {:>7} {:>5} {:>5} {}",
            agent.id.as_str(),
            agent.role.as_str(),
            agent.pid,
            agent.tasks_completed,
            agent.tasks_failed,
            agent.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn run_repair(config: &Config) -> Result<()> {
    let coordinator = open_coordinator(config)?;
    if coordinator.repair_state()? {
        let summary = coordinator.summary()?;
        println!("Repaired: {} tasks, {} agents", summary.total(), summary.agents);
        Ok(())
    } else {
        Err(Error::LockTimeout {
            lock: "event_log",
            timeout: config.lock_timeout(),
        })
    }
}

fn run_worker(config: &Config, action: WorkerAction) -> Result<()> {
    let identity = WorkerIdentity::from_env()?;
    let client = WorkerClient::from_identity(&identity, config)?;
    flog!("Worker command: {} {:?}", identity.agent_id, action);

    match action {
        WorkerAction::Register { pid } => {
            let pid = pid.unwrap_or_else(default_worker_pid);
            match client.register(pid)? {
                Update::Applied => Ok(()),
                Update::Refused(reason) => Err(Error::Validation(reason.to_string())),
            }
        }
        WorkerAction::Heartbeat { task } => match client.heartbeat(task)? {
            Update::Applied => Ok(()),
            Update::Refused(reason) => Err(Error::Validation(reason.to_string())),
        },
        WorkerAction::Tasks => {
            for task in client.check_tasks()? {
                println!("{} {} {}: {}", task.id, task.priority, task.task_type, task.description);
            }
            Ok(())
        }
        WorkerAction::Claim { task_id } => match client.claim(task_id)? {
            Assignment::Assigned => {
                println!("claimed {}", task_id);
                Ok(())
            }
            Assignment::Refused(reason) => Err(refusal_error(task_id, reason)),
        },
        WorkerAction::Start { task_id } => report_update(task_id, client.start(task_id)?),
        WorkerAction::Complete {
            task_id,
            output,
            result,
        } => {
            let result = match result {
                Some(json) => serde_json::from_str::<TaskResult>(&json)?,
                None => TaskResult::success(output.unwrap_or_default()),
            };
            let completion = client.complete(task_id, result)?;
            for id in &completion.follow_ups {
                println!("created {}", id);
            }
            for (next, reason) in &completion.rejected {
                eprintln!("follow-up {} not created: {}", next.task_type, reason);
            }
            report_update(task_id, completion.update)
        }
        WorkerAction::Fail { task_id, error } => report_update(task_id, client.fail(task_id, error)?),
        WorkerAction::Dependency { task_id, wait } => {
            let result = match wait {
                Some(secs) => client.wait_for_dependency(
                    task_id,
                    Duration::from_secs(secs),
                    config.lock_poll_interval().max(Duration::from_millis(500)),
                )?,
                None => client
                    .dependency_result(task_id)?
                    .ok_or_else(|| Error::Validation(format!("task {} is not completed", task_id)))?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        WorkerAction::Work {
            exec,
            max_tasks,
            idle_polls,
            poll_secs,
            heartbeat_secs,
        } => {
            if let Update::Refused(reason) = client.register(std::process::id())? {
                return Err(Error::Validation(reason.to_string()));
            }
            let executor =
                ShellExecutor::new(exec).heartbeat_every(Duration::from_secs(heartbeat_secs.max(1)));
            let options = WorkOptions {
                max_tasks,
                idle_polls: (idle_polls > 0).then_some(idle_polls),
                poll_interval: Duration::from_secs(poll_secs.max(1)),
            };
            let report = client.work(&executor, &options)?;
            println!("completed {}, failed {}", report.completed, report.failed);
            Ok(())
        }
    }
}

/// The process that invoked `fleet worker`, usually the worker script.
#[cfg(unix)]
fn default_worker_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn default_worker_pid() -> u32 {
    std::process::id()
}

fn report_update(task_id: TaskId, update: Update) -> Result<()> {
    match update {
        Update::Applied => Ok(()),
        Update::Refused(reason) => Err(refusal_error(task_id, reason)),
    }
}

/// Turn a refused task operation into the matching error for the exit code.
fn refusal_error(task_id: TaskId, reason: Refusal) -> Error {
    match reason {
        Refusal::UnknownTask => Error::UnknownTask(task_id),
        Refusal::InvalidTransition { from, to } => Error::InvalidTransition { from, to },
        other => Error::Validation(other.to_string()),
    }
}
