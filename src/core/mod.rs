//! Core domain models for fleet coordination.
//!
//! This module contains the fundamental data structures shared by the
//! store, the coordinator, the supervisor and workers: tasks, agents and
//! the events that record every change to them.

pub mod agent;
pub mod event;
pub mod task;

pub use agent::{Agent, AgentId, AgentStatus, Role};
pub use event::{Event, EventRecord, Heartbeat, TaskAssigned, TaskUpdated};
pub use task::{FollowUpTask, Priority, Task, TaskId, TaskResult, TaskStatus};
