//! Process supervisor for the worker fleet.
//!
//! The `Supervisor` launches workers through a [`Launcher`], watches them
//! from a health loop, and feeds them work from a distribution loop. Both
//! loops talk to shared state only through the [`Coordinator`]; the worker
//! table is private and guarded by one async mutex held for a whole cycle.
//!
//! ## Health loop
//!
//! A worker whose process has exited, or whose last heartbeat is older than
//! the timeout even after re-reading the agent registry, is terminated and
//! replaced under a new identity. Replacements inherit the restart count;
//! once it reaches `max_restarts` the worker is marked `Stopped` for good
//! and keeps its role slot so nothing relaunches it behind the operator's
//! back.
//!
//! ## Distribution loop
//!
//! Per role: start one worker if none is running and the role auto-starts,
//! otherwise hand each free worker at most one ready task (round-robin over
//! workers), then spawn one more worker when pending work outnumbers running
//! workers and the role is below its limit. Workers are never retired
//! before shutdown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coordination::{Assignment, Coordinator};
use crate::core::{AgentId, Role};
use crate::orchestration::health::{HealthConfig, HealthVerdict, RestartDecision};
use crate::orchestration::launcher::{LaunchSpec, Launcher, WorkerProcess};
use crate::orchestration::pool::{AgentProcess, WorkerPool, WorkerStatus};
use crate::util::blocking;
use crate::{flog, flog_debug, flog_error, flog_warn, Error, Result};

/// How long to wait for a killed process to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-role worker and queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleStatus {
    /// Workers not stopped.
    pub live: usize,
    /// Active, idle or busy.
    pub running: usize,
    pub busy: usize,
    pub stopped: usize,
    pub max_workers: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub agent_id: AgentId,
    pub role: Role,
    pub status: WorkerStatus,
    pub restart_count: u32,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub roles: BTreeMap<Role, RoleStatus>,
    pub workers: Vec<WorkerInfo>,
    /// Both projection files exist and parse.
    pub coordination_healthy: bool,
}

/// Supervises worker processes for all roles.
///
/// Cloning is cheap and yields a handle to the same fleet.
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<Config>,
    health: HealthConfig,
    coordinator: Coordinator,
    launcher: Arc<dyn Launcher>,
    pool: Arc<Mutex<WorkerPool>>,
    cancel: CancellationToken,
    loops: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Supervisor {
    pub fn new(config: Config, coordinator: Coordinator, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            health: HealthConfig::from(&config),
            config: Arc::new(config),
            coordinator,
            launcher,
            pool: Arc::new(Mutex::new(WorkerPool::new())),
            cancel: CancellationToken::new(),
            loops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Repair coordination state, start each role's initial workers, then
    /// run the health and distribution loops until [`Supervisor::shutdown`].
    pub async fn start(&self) -> Result<()> {
        let coordinator = self.coordinator.clone();
        if !blocking(move || coordinator.repair_state()).await? {
            flog_warn!("supervisor: startup repair skipped, event_log lock busy");
        }

        for role in Role::ALL {
            for _ in 0..self.config.role(role).initial_workers {
                if let Err(e) = self.spawn_worker(role).await {
                    flog_error!("supervisor: initial {} worker failed: {}", role, e);
                }
            }
        }

        let mut loops = self.loops.lock().await;
        loops.push(self.spawn_health_loop());
        loops.push(self.spawn_distribution_loop());
        flog!("supervisor: started");
        Ok(())
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let period = self.config.health_interval();
        flog_debug!("supervisor: health loop every {:?}", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = supervisor.cancel.cancelled() => {
                        flog_debug!("supervisor: health loop cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = supervisor.check_health().await {
                            flog_error!("supervisor: health check failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    fn spawn_distribution_loop(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let period = self.config.distribution_interval();
        flog_debug!("supervisor: distribution loop every {:?}", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = supervisor.cancel.cancelled() => {
                        flog_debug!("supervisor: distribution loop cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = supervisor.distribute().await {
                            flog_error!("supervisor: distribution failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Launch one worker of `role`, if the role has a free slot.
    pub async fn spawn_worker(&self, role: Role) -> Result<AgentId> {
        let mut pool = self.pool.lock().await;
        self.spawn_into(&mut pool, role, 0).await
    }

    async fn spawn_into(
        &self,
        pool: &mut WorkerPool,
        role: Role,
        restart_count: u32,
    ) -> Result<AgentId> {
        let settings = self.config.role(role);
        if pool.slots_used(role) >= settings.max_workers {
            return Err(Error::WorkerSpawn(format!(
                "{} already has its limit of {} workers",
                role, settings.max_workers
            )));
        }

        let agent_id = AgentId::generate(role);
        let paths = self.coordinator.store().paths();
        let workspace = paths.workspace(role);
        tokio::fs::create_dir_all(&workspace).await?;
        let spec = LaunchSpec::for_worker(
            agent_id.clone(),
            role,
            self.config.worker_command.clone(),
            workspace.clone(),
            paths.root.clone(),
            &settings.profile,
        );

        let process = self.launcher.spawn(&spec).await.map_err(|e| {
            flog_error!("supervisor: failed to launch {}: {}", agent_id, e);
            e
        })?;
        let mut worker = AgentProcess::new(agent_id.clone(), role, process, workspace, restart_count);

        tokio::time::sleep(self.config.spawn_grace()).await;
        if !worker.process.is_alive() {
            flog_error!("supervisor: {} exited during startup", agent_id);
            return Err(Error::WorkerSpawn(format!(
                "{} exited during startup",
                agent_id
            )));
        }

        worker.status = WorkerStatus::Active;
        worker.last_heartbeat = Utc::now();
        flog!(
            "supervisor: spawned {} pid={:?} restarts={}",
            agent_id,
            worker.process.pid(),
            restart_count
        );
        pool.insert(worker);
        Ok(agent_id)
    }

    /// One health-loop cycle.
    pub async fn check_health(&self) -> Result<()> {
        let mut pool = self.pool.lock().await;
        let now = Utc::now();
        let mut registry: Option<BTreeMap<AgentId, DateTime<Utc>>> = None;
        let mut marked = Vec::new();

        for worker in pool.iter_mut() {
            if !worker.status.is_live() {
                continue;
            }
            let alive = worker.process.is_alive();
            let mut verdict = self.health.assess(alive, worker.last_heartbeat, now);

            if let HealthVerdict::Stale { .. } = verdict {
                if registry.is_none() {
                    registry = Some(self.registry_heartbeats().await);
                }
                if let Some(seen) = registry.as_ref().and_then(|r| r.get(&worker.agent_id)) {
                    if *seen > worker.last_heartbeat {
                        worker.last_heartbeat = *seen;
                    }
                }
                verdict = self.health.assess(alive, worker.last_heartbeat, now);
            }

            if verdict.needs_restart() {
                flog_warn!("supervisor: {} unhealthy: {}", worker.agent_id, verdict);
                marked.push(worker.agent_id.clone());
            }
        }

        for agent_id in marked {
            self.restart(&mut pool, &agent_id).await;
        }
        Ok(())
    }

    async fn registry_heartbeats(&self) -> BTreeMap<AgentId, DateTime<Utc>> {
        let coordinator = self.coordinator.clone();
        match blocking(move || coordinator.agents()).await {
            Ok(agents) => agents
                .into_iter()
                .map(|agent| (agent.id, agent.last_heartbeat))
                .collect(),
            Err(e) => {
                flog_warn!("supervisor: agent registry unreadable: {}", e);
                BTreeMap::new()
            }
        }
    }

    /// Stop a failed worker and relaunch it, or retire it for good once
    /// its restart budget is spent.
    async fn restart(&self, pool: &mut WorkerPool, agent_id: &AgentId) {
        let Some(mut worker) = pool.remove(agent_id) else {
            return;
        };
        stop_process(worker.process.as_mut(), self.config.terminate_grace()).await;

        match self.health.decide(worker.restart_count) {
            RestartDecision::GiveUp => {
                flog_error!(
                    "supervisor: {} failed after {} restarts, stopped permanently",
                    agent_id,
                    worker.restart_count
                );
                worker.status = WorkerStatus::Stopped;
                pool.insert(worker);
            }
            RestartDecision::Relaunch { restart_count } => {
                match self.spawn_into(pool, worker.role, restart_count).await {
                    Ok(replacement) => {
                        flog!(
                            "supervisor: replaced {} with {} (restart {}/{})",
                            agent_id,
                            replacement,
                            restart_count,
                            self.health.max_restarts
                        );
                    }
                    Err(e) => {
                        flog_error!("supervisor: relaunch of {} failed: {}", agent_id, e);
                        worker.status = WorkerStatus::Error;
                        worker.restart_count = restart_count;
                        pool.insert(worker);
                    }
                }
            }
        }
    }

    /// One distribution-loop cycle.
    pub async fn distribute(&self) -> Result<()> {
        let mut pool = self.pool.lock().await;

        let coordinator = self.coordinator.clone();
        let tasks = blocking(move || coordinator.tasks()).await?;
        let busy: BTreeSet<AgentId> = tasks
            .iter()
            .filter(|task| task.status.is_active())
            .filter_map(|task| task.assigned_to.clone())
            .collect();
        for worker in pool.iter_mut() {
            if worker.status.is_running() {
                worker.status = if busy.contains(&worker.agent_id) {
                    WorkerStatus::Busy
                } else {
                    WorkerStatus::Idle
                };
            }
        }

        for role in Role::ALL {
            if let Err(e) = self.distribute_role(&mut pool, role).await {
                flog_error!("supervisor: distribution for {} failed: {}", role, e);
            }
        }
        Ok(())
    }

    async fn distribute_role(&self, pool: &mut WorkerPool, role: Role) -> Result<()> {
        let settings = self.config.role(role);
        let coordinator = self.coordinator.clone();
        let pending = blocking(move || coordinator.available_tasks(role)).await?;
        if pending.is_empty() {
            return Ok(());
        }

        if pool.running_count(role) == 0 {
            if settings.auto_start && pool.slots_used(role) < settings.max_workers {
                flog!(
                    "supervisor: no {} workers for {} pending tasks, starting one",
                    role,
                    pending.len()
                );
                self.report_spawn(pool, role).await;
            }
        } else {
            let coordinator = self.coordinator.clone();
            let ready = blocking(move || coordinator.ready_tasks(role)).await?;
            let free = pool.free_rotated(role);
            for (task, agent_id) in ready.iter().zip(free.iter()) {
                let coordinator = self.coordinator.clone();
                let task_id = task.id;
                let assignee = agent_id.clone();
                match blocking(move || coordinator.assign_task(task_id, &assignee)).await? {
                    Assignment::Assigned => {
                        if let Some(worker) = pool.get_mut(agent_id) {
                            worker.status = WorkerStatus::Busy;
                        }
                        flog!(
                            "supervisor: assigned {} task {} to {}",
                            task.task_type,
                            task_id.short(),
                            agent_id
                        );
                    }
                    Assignment::Refused(reason) => {
                        flog_debug!("supervisor: {} not assigned: {}", task_id.short(), reason);
                    }
                }
            }
        }

        let running = pool.running_count(role);
        if settings.auto_start
            && pending.len() > running
            && pool.slots_used(role) < settings.max_workers
        {
            flog!(
                "supervisor: scaling up {}: {} pending, {} running",
                role,
                pending.len(),
                running
            );
            self.report_spawn(pool, role).await;
        }
        Ok(())
    }

    /// Spawn failures are reported and left for the next cycle.
    async fn report_spawn(&self, pool: &mut WorkerPool, role: Role) {
        if let Err(e) = self.spawn_into(pool, role, 0).await {
            flog_warn!("supervisor: could not start {} worker: {}", role, e);
        }
    }

    /// Remove a worker record, terminating its process if it still runs.
    /// This is how an operator frees the slot a stopped worker holds.
    pub async fn retire_worker(&self, agent_id: &AgentId) -> Result<()> {
        let mut pool = self.pool.lock().await;
        let mut worker = pool.remove(agent_id).ok_or_else(|| Error::WorkerNotFound {
            id: agent_id.clone(),
        })?;
        stop_process(worker.process.as_mut(), self.config.terminate_grace()).await;
        flog!("supervisor: retired {} ({})", agent_id, worker.status);
        Ok(())
    }

    pub async fn status(&self) -> Result<SupervisorStatus> {
        let coordinator = self.coordinator.clone();
        let (summary, coordination_healthy) =
            blocking(move || Ok((coordinator.summary()?, coordinator.is_healthy()))).await?;

        let pool = self.pool.lock().await;
        let roles = Role::ALL
            .into_iter()
            .map(|role| {
                let status = RoleStatus {
                    live: pool.live_count(role),
                    running: pool.running_count(role),
                    busy: pool.count(role, WorkerStatus::Busy),
                    stopped: pool.count(role, WorkerStatus::Stopped),
                    max_workers: self.config.role(role).max_workers,
                    pending: summary.pending_by_role.get(&role).copied().unwrap_or(0),
                };
                (role, status)
            })
            .collect();
        let workers = pool
            .iter()
            .map(|worker| WorkerInfo {
                agent_id: worker.agent_id.clone(),
                role: worker.role,
                status: worker.status,
                restart_count: worker.restart_count,
                pid: worker.process.pid(),
            })
            .collect();

        Ok(SupervisorStatus {
            roles,
            workers,
            coordination_healthy,
        })
    }

    /// Stop both loops, terminate every worker (graceful, then forced) and
    /// mark them all stopped.
    pub async fn shutdown(&self) {
        flog!("supervisor: shutting down");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                flog_warn!("supervisor: loop ended abnormally: {}", e);
            }
        }

        let mut pool = self.pool.lock().await;
        let grace = self.config.shutdown_grace();
        join_all(
            pool.iter_mut()
                .map(|worker| stop_process(worker.process.as_mut(), grace)),
        )
        .await;
        for worker in pool.iter_mut() {
            worker.status = WorkerStatus::Stopped;
        }
        flog!("supervisor: stopped {} workers", pool.len());
    }
}

/// SIGTERM, wait up to `grace`, then kill.
async fn stop_process(process: &mut dyn WorkerProcess, grace: Duration) {
    if !process.is_alive() {
        return;
    }
    if let Err(e) = process.terminate() {
        flog_warn!("supervisor: terminate failed: {}", e);
    }
    if process.wait(grace).await {
        return;
    }
    flog_warn!(
        "supervisor: pid {:?} ignored terminate for {:?}, killing",
        process.pid(),
        grace
    );
    if let Err(e) = process.kill() {
        flog_error!("supervisor: kill failed: {}", e);
    }
    process.wait(KILL_REAP_TIMEOUT).await;
}
