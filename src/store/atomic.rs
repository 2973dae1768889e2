//! Crash-safe whole-file replacement.
//!
//! A reader of the target path sees either the old contents or the new
//! contents, never a partial write.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::{Error, Result};

/// Write `data` to `path` via a sibling temp file, fsync and rename.
///
/// On any failure before the rename the temp file is removed and the
/// target is left untouched.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = temp_sibling(path)?;
    match write_synced(&tmp, data).and_then(|()| fs::rename(&tmp, path)) {
        Ok(()) => {
            sync_parent(path);
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(Error::Io(e))
        }
    }
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    atomic_write(path, &data)
}

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::Validation(format!("not a file path: {}", path.display())))?;
    let unique = Uuid::new_v4().simple().to_string();
    let tmp_name = format!(
        ".{}.{}.{}.tmp",
        name.to_string_lossy(),
        std::process::id(),
        &unique[..8]
    );
    Ok(path.with_file_name(tmp_name))
}

fn write_synced(tmp: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(tmp)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Persist the rename itself. Best effort: not every platform can fsync
/// a directory.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
