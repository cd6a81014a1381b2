//! Durable stores shared across process death
//!
//! Everything here is plain JSON on disk, written with temp file + rename so a
//! reader in another process never observes a partial write.

pub mod side_channel;
pub mod snapshot;

use std::io::Write;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Result, TimerError};

pub use side_channel::{ActionSlot, CompletionRecord, FileActionSlot, KeyValueActionSlot, PendingAction, SideChannel};
pub use snapshot::{BackgroundSnapshot, FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

/// Serialize `value` and atomically replace `path` with it
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| TimerError::json(format!("serialize {}", path.display()), e))?;

    let parent_dir = path.parent().ok_or_else(|| {
        TimerError::persistence(
            format!("{} has no parent directory", path.display()),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        )
    })?;
    std::fs::create_dir_all(parent_dir)
        .map_err(|e| TimerError::persistence(format!("create {}", parent_dir.display()), e))?;

    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|e| TimerError::persistence("create temp file", e))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|e| TimerError::persistence("write temp file", e))?;
    temp_file
        .flush()
        .map_err(|e| TimerError::persistence("flush temp file", e))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| TimerError::persistence("sync temp file", e))?;
    temp_file
        .persist(path)
        .map_err(|e| TimerError::persistence(format!("persist {}", path.display()), e.error))?;

    Ok(())
}

/// Read a JSON file; missing files, empty files and corrupt JSON all read as `None`.
pub(crate) fn read_json_lenient<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TimerError::persistence(format!("read {}", path.display()), e)),
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Ignoring unreadable {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Remove a file, treating "already gone" as success
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TimerError::persistence(format!("remove {}", path.display()), e)),
    }
}
