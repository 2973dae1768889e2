//! Orchestration layer for the worker fleet.
//!
//! This module launches worker processes, watches their health and feeds
//! them tasks. Everything here consumes the coordination API; nothing
//! touches the event log or locks directly.

pub mod health;
pub mod launcher;
pub mod pool;
pub mod supervisor;

pub use health::{HealthConfig, HealthVerdict, RestartDecision};
pub use launcher::{LaunchSpec, Launcher, ProcessLauncher, WorkerProcess};
pub use pool::{AgentProcess, WorkerPool, WorkerStatus};
pub use supervisor::{RoleStatus, Supervisor, SupervisorStatus, WorkerInfo};
