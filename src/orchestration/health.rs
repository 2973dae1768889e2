//! Health policy for supervised workers.
//!
//! Pure decisions only: whether a worker looks dead or silent, and whether
//! a failed worker may be relaunched. The supervisor does the I/O.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;

/// Default time without a heartbeat before a worker is considered stale.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;

/// Default number of automatic relaunches per worker lineage.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub heartbeat_timeout: Duration,
    pub max_restarts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

impl From<&Config> for HealthConfig {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            max_restarts: config.max_restarts,
        }
    }
}

/// Outcome of checking one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// The process is gone.
    Exited,
    /// The process runs but has not reported for too long.
    Stale { silent_for: Duration },
}

impl HealthVerdict {
    pub fn needs_restart(self) -> bool {
        !matches!(self, HealthVerdict::Healthy)
    }
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "healthy"),
            HealthVerdict::Exited => write!(f, "process exited"),
            HealthVerdict::Stale { silent_for } => {
                write!(f, "no heartbeat for {}s", silent_for.as_secs())
            }
        }
    }
}

/// What to do with a worker that needs a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Launch a replacement carrying this restart count.
    Relaunch { restart_count: u32 },
    /// The lineage has used up its restarts.
    GiveUp,
}

impl HealthConfig {
    pub fn assess(
        &self,
        alive: bool,
        last_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> HealthVerdict {
        if !alive {
            return HealthVerdict::Exited;
        }
        // A heartbeat from the future (clock skew) counts as fresh.
        let silent_for = (now - last_heartbeat).to_std().unwrap_or(Duration::ZERO);
        if silent_for > self.heartbeat_timeout {
            HealthVerdict::Stale { silent_for }
        } else {
            HealthVerdict::Healthy
        }
    }

    pub fn decide(&self, restart_count: u32) -> RestartDecision {
        if restart_count >= self.max_restarts {
            RestartDecision::GiveUp
        } else {
            RestartDecision::Relaunch {
                restart_count: restart_count + 1,
            }
        }
    }
}
