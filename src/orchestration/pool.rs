//! Supervisor-private worker table.
//!
//! The `WorkerPool` tracks every worker the supervisor launched, with its
//! process handle and restart accounting. It is never persisted and never
//! shared outside the supervisor; the agent registry projection is the
//! cross-process view.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::core::{AgentId, Role};
use crate::orchestration::launcher::WorkerProcess;

/// Lifecycle of a supervised worker.
///
/// `Starting → Active → {Idle, Busy} → {Error, Stopped}`. `Stopped` is
/// final: a stopped worker is never relaunched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    Starting,
    Active,
    Idle,
    Busy,
    Error,
    Stopped,
}

impl WorkerStatus {
    /// Running and able to take work or already working.
    pub fn is_running(self) -> bool {
        matches!(self, WorkerStatus::Active | WorkerStatus::Idle | WorkerStatus::Busy)
    }

    pub fn is_live(self) -> bool {
        self != WorkerStatus::Stopped
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Active => "active",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Error => "error",
            WorkerStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Runtime record of one supervised worker.
#[derive(Debug)]
pub struct AgentProcess {
    pub agent_id: AgentId,
    pub role: Role,
    pub process: Box<dyn WorkerProcess>,
    pub workspace: PathBuf,
    /// Latest heartbeat the supervisor has seen (spawn time until the
    /// worker first reports in).
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
    /// Automatic relaunches so far, inherited across replacements.
    pub restart_count: u32,
    pub spawned_at: DateTime<Utc>,
}

impl AgentProcess {
    pub fn new(
        agent_id: AgentId,
        role: Role,
        process: Box<dyn WorkerProcess>,
        workspace: PathBuf,
        restart_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            role,
            process,
            workspace,
            last_heartbeat: now,
            status: WorkerStatus::Starting,
            restart_count,
            spawned_at: now,
        }
    }

    /// Can receive a task this cycle.
    pub fn is_free(&self) -> bool {
        matches!(self.status, WorkerStatus::Active | WorkerStatus::Idle)
    }
}

#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: BTreeMap<AgentId, AgentProcess>,
    cursors: BTreeMap<Role, usize>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, worker: AgentProcess) {
        self.workers.insert(worker.agent_id.clone(), worker);
    }

    pub fn remove(&mut self, id: &AgentId) -> Option<AgentProcess> {
        self.workers.remove(id)
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentProcess> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &AgentId) -> Option<&mut AgentProcess> {
        self.workers.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentProcess> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AgentProcess> {
        self.workers.values_mut()
    }

    /// Records of `role` counted against its worker limit. A permanently
    /// stopped worker keeps its slot until an operator intervenes.
    pub fn slots_used(&self, role: Role) -> usize {
        self.iter().filter(|w| w.role == role).count()
    }

    /// Workers of `role` that are not stopped.
    pub fn live_count(&self, role: Role) -> usize {
        self.iter()
            .filter(|w| w.role == role && w.status.is_live())
            .count()
    }

    pub fn running_count(&self, role: Role) -> usize {
        self.iter()
            .filter(|w| w.role == role && w.status.is_running())
            .count()
    }

    pub fn count(&self, role: Role, status: WorkerStatus) -> usize {
        self.iter()
            .filter(|w| w.role == role && w.status == status)
            .count()
    }

    /// Free workers of `role`, rotated by the role's round-robin cursor so
    /// successive cycles start with a different worker. Advances the cursor.
    pub fn free_rotated(&mut self, role: Role) -> Vec<AgentId> {
        let mut free: Vec<AgentId> = self
            .iter()
            .filter(|w| w.role == role && w.is_free())
            .map(|w| w.agent_id.clone())
            .collect();
        if free.is_empty() {
            return free;
        }
        let cursor = self.cursors.entry(role).or_insert(0);
        let start = *cursor % free.len();
        *cursor = cursor.wrapping_add(1);
        free.rotate_left(start);
        free
    }
}
