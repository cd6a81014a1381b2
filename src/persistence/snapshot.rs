//! Background snapshots of a running session, one per timer class

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{read_json_lenient, remove_if_exists, write_json_atomic};
use crate::{
    error::Result,
    state::{TimerClass, TimerMode, TimerSession},
    utils::clock::secs_between,
};

/// Point-in-time capture of a session taken just before the host loses control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundSnapshot {
    /// The session, with `elapsed_at_last_checkpoint` holding elapsed time at exit
    pub session: TimerSession,
    pub exit_time: DateTime<Utc>,
    pub is_running: bool,
}

impl BackgroundSnapshot {
    pub fn capture(session: &TimerSession, now: DateTime<Utc>) -> Self {
        let mut captured = session.clone();
        captured.elapsed_at_last_checkpoint = session.elapsed_secs(now);
        Self {
            session: captured,
            exit_time: now,
            is_running: session.state == crate::state::TimerState::Running,
        }
    }

    pub fn class(&self) -> TimerClass {
        self.session.class
    }

    pub fn elapsed_at_exit(&self) -> f64 {
        self.session.elapsed_at_last_checkpoint
    }

    /// Elapsed time the session would show at `at`, assuming nothing touched it
    pub fn elapsed_at(&self, at: DateTime<Utc>) -> f64 {
        if self.is_running {
            self.elapsed_at_exit() + secs_between(self.exit_time, at).max(0.0)
        } else {
            self.elapsed_at_exit()
        }
    }

    /// Countdown/interval time left at exit
    pub fn remaining_at_exit(&self) -> Option<f64> {
        match self.session.mode {
            TimerMode::Stopwatch => None,
            TimerMode::Countdown | TimerMode::Interval => {
                self.session.total_duration.map(|total| total - self.elapsed_at_exit())
            }
        }
    }
}

/// Durable, per-class snapshot storage.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, class: TimerClass) -> Result<Option<BackgroundSnapshot>>;
    fn save(&self, snapshot: &BackgroundSnapshot) -> Result<()>;
    fn clear(&self, class: TimerClass) -> Result<()>;
}

/// Snapshot files in a directory, `snapshot-<class>.json`
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path_for(&self, class: TimerClass) -> PathBuf {
        self.dir.join(format!("snapshot-{}.json", class))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, class: TimerClass) -> Result<Option<BackgroundSnapshot>> {
        let snapshot: Option<BackgroundSnapshot> = read_json_lenient(&self.path_for(class))?;
        // A file written under the wrong name must not leak into another class
        Ok(snapshot.filter(|s| s.class() == class))
    }

    fn save(&self, snapshot: &BackgroundSnapshot) -> Result<()> {
        write_json_atomic(&self.path_for(snapshot.class()), snapshot)
    }

    fn clear(&self, class: TimerClass) -> Result<()> {
        remove_if_exists(&self.path_for(class))
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<TimerClass, BackgroundSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, class: TimerClass) -> Result<Option<BackgroundSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .ok()
            .and_then(|snapshots| snapshots.get(&class).cloned()))
    }

    fn save(&self, snapshot: &BackgroundSnapshot) -> Result<()> {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.insert(snapshot.class(), snapshot.clone());
        }
        Ok(())
    }

    fn clear(&self, class: TimerClass) -> Result<()> {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.remove(&class);
        }
        Ok(())
    }
}
