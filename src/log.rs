//! File logging shared by the supervisor and its workers.
//!
//! Every process in a fleet appends to the same file (by default
//! `~/.fleet/fleet.log`), so each line carries the writer's pid:
//!
//! ```text
//! [14:03:07.512] [WARN] [4711] lock: timed out on task_assignment after 10s
//! ```
//!
//! What lands at each level:
//! - ERROR: corrupt event log, failed launches, workers stopped for good
//! - WARN: lock timeouts, skipped or truncated torn records, projection
//!   recovery, restarts
//! - INFO: task creation and assignment, spawns, scale-up, startup and
//!   shutdown
//! - DEBUG: lock acquire/release, loop scheduling, refused assignments
//! - TRACE: individual appends and ignored fold steps
//!
//! Nothing is written until `init*` runs, so library callers and tests stay
//! silent. `--debug` or `FLEET_DEBUG=1` lowers the threshold to DEBUG.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Log to `~/.fleet/fleet.log` at INFO unless `FLEET_DEBUG` is set.
pub fn init() {
    init_with_debug(false);
}

pub fn init_with_debug(debug: bool) {
    match dirs::home_dir() {
        Some(home) => init_at(&home.join(".fleet").join("fleet.log"), debug),
        None => set_threshold(debug),
    }
}

/// Log to an explicit file. The file is appended to, never truncated.
pub fn init_at(path: &Path, debug: bool) {
    set_threshold(debug);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    LOG_PATH.set(path.to_path_buf()).ok();
}

fn set_threshold(debug: bool) {
    let from_env = std::env::var("FLEET_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let level = if debug || from_env {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

fn format_line(timestamp: &str, level: LogLevel, pid: u32, msg: &str) -> String {
    format!("[{}] [{}] [{}] {}", timestamp, level.as_str(), pid, msg)
}

/// Append `msg` if `level` passes the threshold and logging is set up.
/// Write failures are dropped; logging never fails an operation.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed)) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
        let _ = writeln!(
            file,
            "{}",
            format_line(&timestamp, level, std::process::id(), msg)
        );
    }
}

#[macro_export]
macro_rules! flog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! flog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! flog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Only written in debug mode.
#[macro_export]
macro_rules! flog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! flog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
