//! Event-sourced coordination store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <root>/
//!   event-log.jsonl       append-only source of truth
//!   task-queue.json       task projection (derived cache)
//!   agent-registry.json   agent projection (derived cache)
//!   locks/                one permanent file per lock class
//! ```
//!
//! Every mutation goes through [`Store::commit`], which appends and then
//! rebuilds both projections inside the same `event_log` critical section,
//! so a reader that acquires any lock after a commit sees its effect.
//! Callers that need check-then-append take their operation-class lock
//! first; the order is always operation lock, then `event_log`.

pub mod atomic;
pub mod lock;
pub mod log;
pub mod projection;

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::core::{Agent, AgentId, Event, EventRecord, Task, TaskId};
use crate::{flog_debug, flog_error, flog_warn, Error, Result};

pub use atomic::{atomic_write, atomic_write_json};
pub use lock::{LockClass, LockGuard, LockManager};
pub use log::EventLog;
pub use projection::{AgentRegistryFile, Projection, TaskQueueFile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub root: PathBuf,
    pub event_log: PathBuf,
    pub task_queue: PathBuf,
    pub agent_registry: PathBuf,
    pub locks: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            event_log: root.join("event-log.jsonl"),
            task_queue: root.join("task-queue.json"),
            agent_registry: root.join("agent-registry.json"),
            locks: root.join("locks"),
            root,
        }
    }

    /// Working directory handed to workers of one role.
    pub fn workspace(&self, role: crate::core::Role) -> PathBuf {
        self.root.join("agent-workspaces").join(format!("{}-agent", role))
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    paths: StorePaths,
    log: EventLog,
    locks: LockManager,
}

impl Store {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, lock_timeout: Duration, poll: Duration) -> Result<Self> {
        let paths = StorePaths::new(root);
        fs::create_dir_all(&paths.root)?;
        fs::create_dir_all(&paths.locks)?;
        let store = Self {
            log: EventLog::new(&paths.event_log),
            locks: LockManager::new(&paths.locks, lock_timeout, poll),
            paths,
        };
        flog_debug!("store: opened {}", store.paths.root.display());
        Ok(store)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            config.store_dir()?,
            config.lock_timeout(),
            config.lock_poll_interval(),
        )
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Append `event` and rebuild both projections under the `event_log`
    /// lock. Returns the rebuilt projection, or `None` if the lock could not
    /// be taken (nothing was appended).
    pub fn commit(&self, event: Event) -> Result<Option<Projection>> {
        let Some(_guard) = self.locks.try_acquire(LockClass::LogAppend)? else {
            return Ok(None);
        };
        let record = EventRecord::new(event);
        self.log.append(&record)?;
        self.rebuild_locked().map(Some)
    }

    /// Replay the log into memory without touching the projection files.
    pub fn replay(&self) -> Result<Projection> {
        Ok(Projection::fold(&self.log.replay()?))
    }

    /// Force a full rebuild of both projection files from the log.
    /// Returns `None` if the `event_log` lock stayed contended.
    pub fn repair(&self) -> Result<Option<Projection>> {
        let Some(_guard) = self.locks.try_acquire(LockClass::LogAppend)? else {
            return Ok(None);
        };
        let projection = self.rebuild_locked()?;
        flog_debug!("store: repaired projections at version {}", projection.version);
        Ok(Some(projection))
    }

    fn rebuild_locked(&self) -> Result<Projection> {
        let projection = self.replay()?;
        let now = Utc::now();
        atomic_write_json(&self.paths.task_queue, &projection.task_queue_file(now))?;
        atomic_write_json(&self.paths.agent_registry, &projection.agent_registry_file(now))?;
        Ok(projection)
    }

    /// Current task table, healing a missing or unreadable projection file
    /// from the log.
    pub fn read_tasks(&self) -> Result<BTreeMap<TaskId, Task>> {
        match read_projection::<TaskQueueFile>(&self.paths.task_queue) {
            Ok(Some(file)) => Ok(file.tasks),
            Ok(None) => Ok(self.recover()?.tasks),
            Err(e) => {
                flog_warn!("store: task projection unreadable ({}), replaying log", e);
                Ok(self.recover()?.tasks)
            }
        }
    }

    /// Current agent table, healing like [`Store::read_tasks`].
    pub fn read_agents(&self) -> Result<BTreeMap<AgentId, Agent>> {
        match read_projection::<AgentRegistryFile>(&self.paths.agent_registry) {
            Ok(Some(file)) => Ok(file.agents),
            Ok(None) => Ok(self.recover()?.agents),
            Err(e) => {
                flog_warn!("store: agent projection unreadable ({}), replaying log", e);
                Ok(self.recover()?.agents)
            }
        }
    }

    /// Whether both projection files exist and parse.
    pub fn projections_healthy(&self) -> bool {
        matches!(
            read_projection::<TaskQueueFile>(&self.paths.task_queue),
            Ok(Some(_))
        ) && matches!(
            read_projection::<AgentRegistryFile>(&self.paths.agent_registry),
            Ok(Some(_))
        )
    }

    /// Rewrite the projections if the lock is free; otherwise fall back to
    /// an in-memory replay so the reader still gets authoritative state.
    fn recover(&self) -> Result<Projection> {
        match self.repair() {
            Ok(Some(projection)) => Ok(projection),
            Ok(None) => self.replay(),
            Err(e @ Error::LogCorrupt { .. }) => {
                flog_error!("store: {}", e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

fn read_projection<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::ProjectionCorrupt(format!("{}: {}", path.display(), e)))
}
