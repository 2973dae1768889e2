use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::Role;
use crate::{flog_debug, Error, Result};

/// Per-role worker limits and launch profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub max_workers: usize,
    #[serde(default)]
    pub initial_workers: usize,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Execution profile handed to the worker through `FLEET_PROFILE`.
    pub profile: String,
}

impl RoleConfig {
    pub fn defaults_for(role: Role) -> Self {
        match role {
            Role::Discovery => Self {
                max_workers: 2,
                initial_workers: 1,
                auto_start: true,
                profile: "fast".to_string(),
            },
            Role::Generation => Self {
                max_workers: 2,
                initial_workers: 1,
                auto_start: true,
                profile: "balanced".to_string(),
            },
            Role::Review => Self {
                max_workers: 1,
                initial_workers: 0,
                auto_start: false,
                profile: "thorough".to_string(),
            },
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_path: Option<String>,
    pub lock_timeout_secs: u64,
    pub lock_poll_interval_ms: u64,
    pub health_interval_secs: u64,
    pub distribution_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub max_restarts: u32,
    pub spawn_grace_ms: u64,
    pub terminate_grace_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Worker argv. The first element is resolved on `PATH`.
    pub worker_command: Vec<String>,
    /// `[roles.<role>]` tables keyed by role name.
    pub roles: BTreeMap<String, RoleConfig>,
    /// Explicit task type → role entries, matched case-insensitively.
    pub routing: BTreeMap<String, Role>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: None,
            lock_timeout_secs: 10,
            lock_poll_interval_ms: 25,
            health_interval_secs: 30,
            distribution_interval_secs: 10,
            heartbeat_timeout_secs: 60,
            max_restarts: 3,
            spawn_grace_ms: 2000,
            terminate_grace_secs: 10,
            shutdown_grace_secs: 5,
            worker_command: vec![
                "fleet".to_string(),
                "worker".to_string(),
                "work".to_string(),
                "--exec".to_string(),
                "echo \"$FLEET_TASK_DESCRIPTION\"".to_string(),
            ],
            roles: Role::ALL
                .into_iter()
                .map(|role| (role.to_string(), RoleConfig::defaults_for(role)))
                .collect(),
            routing: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn fleet_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".fleet"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::fleet_dir()?.join("fleet.toml"))
    }

    /// Directory holding the event log, projections and lock files.
    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::fleet_dir()?.join("coordination")),
        }
    }

    /// Settings for a role, falling back to built-in defaults when the
    /// config file omits its table.
    pub fn role(&self, role: Role) -> RoleConfig {
        self.roles
            .get(role.as_str())
            .cloned()
            .unwrap_or_else(|| RoleConfig::defaults_for(role))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn distribution_interval(&self) -> Duration {
        Duration::from_secs(self.distribution_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_command.is_empty() {
            return Err(Error::Validation("worker_command must not be empty".into()));
        }
        if self.lock_poll_interval_ms == 0
            || self.health_interval_secs == 0
            || self.distribution_interval_secs == 0
        {
            return Err(Error::Validation(
                "lock poll and loop intervals must be positive".into(),
            ));
        }
        for role in Role::ALL {
            let settings = self.role(role);
            if settings.initial_workers > settings.max_workers {
                return Err(Error::Validation(format!(
                    "{} initial_workers ({}) exceeds max_workers ({})",
                    role, settings.initial_workers, settings.max_workers
                )));
            }
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        flog_debug!(
            "Config loaded: store_path={:?}, max_restarts={}, routing_entries={}",
            config.store_path,
            config.max_restarts,
            config.routing.len()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let fleet_dir = Self::fleet_dir()?;
        if !fleet_dir.exists() {
            flog_debug!("Creating fleet directory");
            fs::create_dir_all(&fleet_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let store_dir = self.store_dir()?;
        flog_debug!("Config::ensure_dirs store={}", store_dir.display());
        if !store_dir.exists() {
            fs::create_dir_all(&store_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
