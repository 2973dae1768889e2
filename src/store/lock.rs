//! Named, timeout-bounded advisory locks.
//!
//! Each lock class owns one permanent file under the lock directory.
//! Exclusivity comes from `flock` on an open descriptor (via `fs2`), so it
//! holds across processes and across threads of one process; the file's
//! contents are never read.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::util::poll_until;
use crate::{flog_debug, flog_warn, Error, Result};

/// The four coarse lock classes, one per operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockClass {
    LogAppend,
    TaskAssign,
    TaskUpdate,
    AgentRegistry,
}

impl LockClass {
    pub fn name(self) -> &'static str {
        match self {
            LockClass::LogAppend => "event_log",
            LockClass::TaskAssign => "task_assignment",
            LockClass::TaskUpdate => "task_update",
            LockClass::AgentRegistry => "agent_registry",
        }
    }

    fn file_name(self) -> String {
        format!("{}.lock", self.name())
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            poll_interval,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Try to take `class` within the default timeout. `Ok(None)` means the
    /// lock stayed contended; that is an expected outcome, not an error.
    pub fn try_acquire(&self, class: LockClass) -> Result<Option<LockGuard>> {
        self.try_acquire_within(class, self.timeout)
    }

    pub fn try_acquire_within(
        &self,
        class: LockClass,
        timeout: Duration,
    ) -> Result<Option<LockGuard>> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(class.file_name()))?;

        let acquired = poll_until(timeout, self.poll_interval, || {
            match file.try_lock_exclusive() {
                Ok(()) => Ok(Some(())),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
                Err(e) => Err(Error::Io(e)),
            }
        })?;

        match acquired {
            Some(()) => {
                flog_debug!("lock: acquired {}", class.name());
                Ok(Some(LockGuard {
                    file: Some(file),
                    class,
                }))
            }
            None => {
                flog_warn!("lock: timed out on {} after {:?}", class.name(), timeout);
                Ok(None)
            }
        }
    }

    /// Like `try_acquire` but turns contention into `Error::LockTimeout`.
    pub fn acquire(&self, class: LockClass) -> Result<LockGuard> {
        self.try_acquire(class)?.ok_or(Error::LockTimeout {
            lock: class.name(),
            timeout: self.timeout,
        })
    }
}

/// Holds a lock until dropped or released.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    class: LockClass,
}

impl LockGuard {
    pub fn class(&self) -> LockClass {
        self.class
    }

    /// Release now. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            flog_debug!("lock: released {}", self.class.name());
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
