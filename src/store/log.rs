//! Append-only JSONL event log.
//!
//! The log is the only authoritative state. Appends must happen under the
//! `event_log` lock; replay needs no lock because records are only ever
//! added at the tail.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::core::EventRecord;
use crate::{flog_trace, flog_warn, Error, Result};

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one durable record. The caller holds the `event_log` lock.
    pub fn append(&self, record: &EventRecord) -> Result<()> {
        self.heal_tail()?;

        let mut line = record.to_line()?;
        line.push('\n');

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        flog_trace!("log: appended {} {}", record.event.type_name(), record.id);
        Ok(())
    }

    /// Read every record in log order.
    ///
    /// A malformed final record is skipped (a crash mid-append, possibly
    /// inside a multibyte character); a malformed record anywhere else is
    /// `Error::LogCorrupt`.
    pub fn replay(&self) -> Result<Vec<EventRecord>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<(usize, &[u8])> = content
            .split(|&b| b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
            .collect();
        let last = lines.len().saturating_sub(1);

        let mut records = Vec::with_capacity(lines.len());
        for (pos, (index, line)) in lines.into_iter().enumerate() {
            match serde_json::from_slice::<EventRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if pos == last => {
                    flog_warn!("log: skipping torn trailing record at line {}: {}", index + 1, e);
                }
                Err(e) => {
                    return Err(Error::LogCorrupt {
                        line: index + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }

    /// Drop a final record that lacks its terminating newline so the next
    /// append does not bury it mid-log. Such a record was never
    /// acknowledged. Complete records are never removed, even if they do
    /// not parse.
    fn heal_tail(&self) -> Result<()> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if content.is_empty() || content.ends_with(b"\n") {
            return Ok(());
        }

        let start = content.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        flog_warn!(
            "log: truncating torn tail of {} bytes in {}",
            content.len() - start,
            self.path.display()
        );
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(start as u64)?;
        file.sync_data()?;
        Ok(())
    }
}
