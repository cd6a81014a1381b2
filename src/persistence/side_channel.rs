//! Durable side-channel carrying control actions from the live surface to the host
//!
//! The companion surface writes a [`PendingAction`] into every slot before it
//! fires the payload-less signal. The host reads the slots in order (first
//! success wins) and clears all of them, so an action is consumed at most once
//! no matter which representation survived.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use ulid::Ulid;

use super::{read_json_lenient, remove_if_exists, write_json_atomic};
use crate::{
    error::Result,
    state::{TimerAction, TimerClass},
};

/// A control action the user issued on the live surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub action: TimerAction,
    pub timestamp: DateTime<Utc>,
    pub activity_id: String,
    pub timer_type: TimerClass,
    #[serde(default)]
    pub correlation_id: String,
}

impl PendingAction {
    /// Timestamps are truncated to milliseconds so every slot representation
    /// round-trips to the same value.
    pub fn new(action: TimerAction, class: TimerClass, activity_id: &str, now: DateTime<Utc>) -> Self {
        let timestamp = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        Self {
            action,
            timestamp,
            activity_id: activity_id.to_string(),
            timer_type: class,
            correlation_id: Ulid::new().to_string(),
        }
    }
}

/// What the UI needs to run its completion flow for a session stopped from the surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub elapsed_secs: f64,
    pub started_at: DateTime<Utc>,
    pub method_name: String,
    pub timestamp: DateTime<Utc>,
}

/// One representation of the per-class action slot.
pub trait ActionSlot: Send + Sync {
    fn name(&self) -> &'static str;
    fn read(&self, class: TimerClass) -> Result<Option<PendingAction>>;
    fn write(&self, action: &PendingAction) -> Result<()>;
    fn clear(&self, class: TimerClass) -> Result<()>;
}

/// One JSON file per class, `pending-action-<class>.json`
#[derive(Debug, Clone)]
pub struct FileActionSlot {
    dir: PathBuf,
}

impl FileActionSlot {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, class: TimerClass) -> PathBuf {
        self.dir.join(format!("pending-action-{}.json", class))
    }
}

impl ActionSlot for FileActionSlot {
    fn name(&self) -> &'static str {
        "file"
    }

    fn read(&self, class: TimerClass) -> Result<Option<PendingAction>> {
        let action: Option<PendingAction> = read_json_lenient(&self.path_for(class))?;
        Ok(action.filter(|a| a.timer_type == class))
    }

    fn write(&self, action: &PendingAction) -> Result<()> {
        write_json_atomic(&self.path_for(action.timer_type), action)
    }

    fn clear(&self, class: TimerClass) -> Result<()> {
        remove_if_exists(&self.path_for(class))
    }
}

/// A flat key-value document shared by both processes, `shared-defaults.json`.
///
/// Keys are namespaced by class: `<class>.lastTimerAction`,
/// `<class>.lastActionTime` (unix seconds), `<class>.lastActivityId`,
/// `<class>.correlationId`.
#[derive(Debug, Clone)]
pub struct KeyValueActionSlot {
    path: PathBuf,
}

impl KeyValueActionSlot {
    const ACTION: &'static str = "lastTimerAction";
    const TIME: &'static str = "lastActionTime";
    const ACTIVITY: &'static str = "lastActivityId";
    const CORRELATION: &'static str = "correlationId";

    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("shared-defaults.json"),
        }
    }

    fn key(class: TimerClass, field: &str) -> String {
        format!("{}.{}", class, field)
    }

    fn load(&self) -> Result<BTreeMap<String, Value>> {
        Ok(read_json_lenient(&self.path)?.unwrap_or_default())
    }
}

impl ActionSlot for KeyValueActionSlot {
    fn name(&self) -> &'static str {
        "key-value"
    }

    fn read(&self, class: TimerClass) -> Result<Option<PendingAction>> {
        let defaults = self.load()?;

        let Some(action) = defaults
            .get(&Self::key(class, Self::ACTION))
            .and_then(Value::as_str)
            .and_then(TimerAction::from_name)
        else {
            return Ok(None);
        };
        let Some(timestamp) = defaults
            .get(&Self::key(class, Self::TIME))
            .and_then(Value::as_f64)
            .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0).round() as i64))
        else {
            return Ok(None);
        };

        let text = |field: &str| {
            defaults
                .get(&Self::key(class, field))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(Some(PendingAction {
            action,
            timestamp,
            activity_id: text(Self::ACTIVITY),
            timer_type: class,
            correlation_id: text(Self::CORRELATION),
        }))
    }

    fn write(&self, action: &PendingAction) -> Result<()> {
        let class = action.timer_type;
        let mut defaults = self.load()?;
        defaults.insert(Self::key(class, Self::ACTION), Value::from(action.action.as_str()));
        defaults.insert(
            Self::key(class, Self::TIME),
            Value::from(action.timestamp.timestamp_millis() as f64 / 1000.0),
        );
        defaults.insert(Self::key(class, Self::ACTIVITY), Value::from(action.activity_id.clone()));
        defaults.insert(
            Self::key(class, Self::CORRELATION),
            Value::from(action.correlation_id.clone()),
        );
        write_json_atomic(&self.path, &defaults)
    }

    fn clear(&self, class: TimerClass) -> Result<()> {
        let mut defaults = self.load()?;
        let prefix = format!("{}.", class);
        let before = defaults.len();
        defaults.retain(|key, _| !key.starts_with(&prefix));
        if defaults.len() == before {
            return Ok(());
        }
        write_json_atomic(&self.path, &defaults)
    }
}

/// The redundant side-channel: every slot written, first readable slot wins.
pub struct SideChannel {
    dir: PathBuf,
    slots: Vec<Box<dyn ActionSlot>>,
}

impl SideChannel {
    /// Open the standard file + key-value pair rooted at `dir`
    pub fn open(dir: &Path) -> Self {
        Self::with_slots(
            dir,
            vec![
                Box::new(FileActionSlot::new(dir)),
                Box::new(KeyValueActionSlot::new(dir)),
            ],
        )
    }

    pub fn with_slots(dir: &Path, slots: Vec<Box<dyn ActionSlot>>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            slots,
        }
    }

    /// Write the action to every slot; succeeds if at least one write landed
    pub fn post(&self, action: &PendingAction) -> Result<()> {
        let mut last_error = None;
        let mut written = 0;
        for slot in &self.slots {
            match slot.write(action) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!("Failed to write {} action to {} slot: {}", action.action, slot.name(), e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if written == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Read the pending action for `class` and clear every slot
    pub fn take(&self, class: TimerClass) -> Option<PendingAction> {
        let mut found = None;
        for slot in &self.slots {
            match slot.read(class) {
                Ok(Some(action)) => {
                    debug!("Read pending {} for {} from {} slot", action.action, class, slot.name());
                    found = Some(action);
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to read {} slot for {}: {}", slot.name(), class, e),
            }
        }

        if found.is_some() {
            self.clear(class);
        }
        found
    }

    pub fn clear(&self, class: TimerClass) {
        for slot in &self.slots {
            if let Err(e) = slot.clear(class) {
                warn!("Failed to clear {} slot for {}: {}", slot.name(), class, e);
            }
        }
    }

    fn completion_path(&self, class: TimerClass) -> PathBuf {
        self.dir.join(format!("pending-completion-{}.json", class))
    }

    pub fn store_completion(&self, class: TimerClass, record: &CompletionRecord) -> Result<()> {
        write_json_atomic(&self.completion_path(class), record)
    }

    /// Consume the completion record left by a surface-initiated stop
    pub fn take_completion(&self, class: TimerClass) -> Result<Option<CompletionRecord>> {
        let path = self.completion_path(class);
        let record = read_json_lenient(&path)?;
        remove_if_exists(&path)?;
        Ok(record)
    }
}
