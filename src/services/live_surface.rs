//! Adapter for the live status surface
//!
//! The surface runs in a process the host does not control and keeps its own
//! clock. Both sides exchange its content through a small JSON file per class:
//! the host publishes on every transition, the companion rewrites it when the
//! user taps pause/resume/stop on the surface itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    persistence::{read_json_lenient, remove_if_exists, write_json_atomic},
    state::{TimerAction, TimerClass, TimerMode, TimerSession, TimerState},
    utils::clock::{add_secs, secs_between},
};

/// Upper bound on believable elapsed time reported by the surface
pub const PLAUSIBLE_ELAPSED_SECS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// What the surface is currently displaying, on its own clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceContent {
    pub activity_id: String,
    pub timer_class: TimerClass,
    pub method_name: String,
    pub session_type: TimerMode,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_paused_secs: f64,
    /// Total duration for countdowns, zero for open-ended sessions
    #[serde(default)]
    pub duration_secs: f64,
}

impl SurfaceContent {
    pub fn from_session(session: &TimerSession) -> Self {
        Self {
            activity_id: session.id.clone(),
            timer_class: session.class,
            method_name: session
                .method_name
                .clone()
                .unwrap_or_else(|| "Practice".to_string()),
            session_type: session.mode,
            started_at: session.started_at,
            paused_at: match session.state {
                TimerState::Paused => session.paused_at,
                _ => None,
            },
            total_paused_secs: 0.0,
            duration_secs: session.total_duration.unwrap_or(0.0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        let until = self.paused_at.unwrap_or(now);
        secs_between(self.started_at, until) - self.total_paused_secs
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> f64 {
        (self.duration_secs - self.elapsed_secs(now)).max(0.0)
    }

    /// Whether the surface's elapsed time can be trusted over a local recomputation
    pub fn is_plausible(&self, now: DateTime<Utc>) -> bool {
        let elapsed = self.elapsed_secs(now);
        elapsed.is_finite() && (0.0..=PLAUSIBLE_ELAPSED_SECS).contains(&elapsed)
    }

    /// Apply a control tapped on the surface, the way the widget does it locally.
    ///
    /// Returns `false` for `stop`: the surface ends and its content goes away.
    pub fn apply_action(&mut self, action: TimerAction, now: DateTime<Utc>) -> bool {
        match action {
            TimerAction::Pause => {
                if self.paused_at.is_none() {
                    self.paused_at = Some(now);
                }
                true
            }
            TimerAction::Resume => {
                if let Some(paused_at) = self.paused_at.take() {
                    let pause_window = secs_between(paused_at, now).max(0.0);
                    self.started_at = add_secs(self.started_at, pause_window);
                }
                true
            }
            TimerAction::Stop => false,
        }
    }
}

/// Read/write access to the live status surface.
pub trait LiveSurface: Send + Sync {
    fn current(&self, class: TimerClass) -> Result<Option<SurfaceContent>>;
    fn publish(&self, content: &SurfaceContent) -> Result<()>;
    fn end(&self, class: TimerClass) -> Result<()>;

    /// Classes the surface is currently displaying
    fn active_classes(&self) -> Vec<TimerClass> {
        TimerClass::ALL
            .into_iter()
            .filter(|class| matches!(self.current(*class), Ok(Some(_))))
            .collect()
    }
}

/// Surface content files in the shared directory, `surface-<class>.json`
#[derive(Debug, Clone)]
pub struct FileSurface {
    dir: PathBuf,
}

impl FileSurface {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, class: TimerClass) -> PathBuf {
        self.dir.join(format!("surface-{}.json", class))
    }
}

impl LiveSurface for FileSurface {
    fn current(&self, class: TimerClass) -> Result<Option<SurfaceContent>> {
        let content: Option<SurfaceContent> = read_json_lenient(&self.path_for(class))?;
        Ok(content.filter(|c| c.timer_class == class))
    }

    fn publish(&self, content: &SurfaceContent) -> Result<()> {
        write_json_atomic(&self.path_for(content.timer_class), content)
    }

    fn end(&self, class: TimerClass) -> Result<()> {
        remove_if_exists(&self.path_for(class))
    }
}

#[derive(Debug, Default)]
pub struct MemorySurface {
    contents: Mutex<HashMap<TimerClass, SurfaceContent>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LiveSurface for MemorySurface {
    fn current(&self, class: TimerClass) -> Result<Option<SurfaceContent>> {
        Ok(self
            .contents
            .lock()
            .ok()
            .and_then(|contents| contents.get(&class).cloned()))
    }

    fn publish(&self, content: &SurfaceContent) -> Result<()> {
        if let Ok(mut contents) = self.contents.lock() {
            contents.insert(content.timer_class, content.clone());
        }
        Ok(())
    }

    fn end(&self, class: TimerClass) -> Result<()> {
        if let Ok(mut contents) = self.contents.lock() {
            contents.remove(&class);
        }
        Ok(())
    }
}
