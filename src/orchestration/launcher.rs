//! Worker launch capability.
//!
//! The supervisor never spawns processes directly; it goes through a
//! [`Launcher`], so tests can substitute scripted processes.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::core::{AgentId, Role};
use crate::{flog, flog_debug, Error, Result};

pub const ENV_AGENT_ID: &str = "FLEET_AGENT_ID";
pub const ENV_AGENT_ROLE: &str = "FLEET_AGENT_ROLE";
pub const ENV_WORKSPACE: &str = "FLEET_WORKSPACE";
pub const ENV_COORDINATION_PATH: &str = "FLEET_COORDINATION_PATH";
pub const ENV_PROFILE: &str = "FLEET_PROFILE";

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub agent_id: AgentId,
    pub role: Role,
    /// argv; the first element is the program.
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: PathBuf,
    /// File receiving the worker's stdout and stderr. `None` discards them.
    pub output: Option<PathBuf>,
}

impl LaunchSpec {
    /// Build the spec for a worker, filling in the standard environment.
    pub fn for_worker(
        agent_id: AgentId,
        role: Role,
        command: Vec<String>,
        workdir: PathBuf,
        store_root: PathBuf,
        profile: &str,
    ) -> Self {
        let env = vec![
            (ENV_AGENT_ID.to_string(), agent_id.to_string()),
            (ENV_AGENT_ROLE.to_string(), role.to_string()),
            (ENV_WORKSPACE.to_string(), workdir.display().to_string()),
            (
                ENV_COORDINATION_PATH.to_string(),
                store_root.display().to_string(),
            ),
            (ENV_PROFILE.to_string(), profile.to_string()),
        ];
        Self {
            output: Some(workdir.join("worker.log")),
            agent_id,
            role,
            command,
            env,
            workdir,
        }
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Handle to a running worker.
#[async_trait]
pub trait WorkerProcess: Send + std::fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still running. Reaps it if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to stop (SIGTERM).
    fn terminate(&mut self) -> Result<()>;

    /// Stop the process unconditionally.
    fn kill(&mut self) -> Result<()>;

    /// Wait up to `timeout` for exit. Returns `true` if the process exited.
    async fn wait(&mut self, timeout: Duration) -> bool;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches workers as OS processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>> {
        let Some((program, args)) = spec.command.split_first() else {
            return Err(Error::WorkerSpawn("empty worker command".to_string()));
        };
        let program = which::which(program)
            .map_err(|e| Error::WorkerSpawn(format!("{}: {}", program, e)))?;

        fs::create_dir_all(&spec.workdir)?;
        let mut command = Command::new(&program);
        command
            .args(args)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(false);

        match &spec.output {
            Some(path) => {
                let log = OpenOptions::new().create(true).append(true).open(path)?;
                command.stdout(Stdio::from(log.try_clone()?));
                command.stderr(Stdio::from(log));
            }
            None => {
                command.stdout(Stdio::null());
                command.stderr(Stdio::null());
            }
        }

        let child = command
            .spawn()
            .map_err(|e| Error::WorkerSpawn(format!("{}: {}", program.display(), e)))?;
        flog!(
            "launcher: started {} ({}) pid={:?}",
            spec.agent_id,
            program.display(),
            child.id()
        );
        Ok(Box::new(ChildProcess { child }))
    }
}

#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        flog_debug!("launcher: SIGTERM pid={}", pid);
        send_sigterm(pid)
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.child.wait()).await.is_ok()
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|_| Error::Validation(format!("pid {} out of range", pid)))?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Io(std::io::Error::from(e))),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<()> {
    Ok(())
}
