//! Timer session structure and its state machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{
    error::{Result, TimerError},
    utils::clock::{add_secs, secs_between},
};

/// An independent lane of the at-most-one-active invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerClass {
    #[serde(alias = "main")]
    Primary,
    Quick,
}

impl TimerClass {
    pub const ALL: [TimerClass; 2] = [TimerClass::Primary, TimerClass::Quick];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerClass::Primary => "primary",
            TimerClass::Quick => "quick",
        }
    }

    /// Parse a class name as written by the companion surface
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "primary" | "main" => Some(TimerClass::Primary),
            "quick" => Some(TimerClass::Quick),
            _ => None,
        }
    }
}

impl fmt::Display for TimerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerMode {
    Stopwatch,
    Countdown,
    Interval,
}

impl TimerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerMode::Stopwatch => "stopwatch",
            TimerMode::Countdown => "countdown",
            TimerMode::Interval => "interval",
        }
    }
}

impl fmt::Display for TimerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimerState::Stopped => "stopped",
            TimerState::Running => "running",
            TimerState::Paused => "paused",
        };
        f.write_str(label)
    }
}

/// Control actions that can originate from the live status surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerAction {
    Pause,
    Resume,
    Stop,
}

impl TimerAction {
    pub const ALL: [TimerAction; 3] = [TimerAction::Pause, TimerAction::Resume, TimerAction::Stop];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerAction::Pause => "pause",
            TimerAction::Resume => "resume",
            TimerAction::Stop => "stop",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pause" => Some(TimerAction::Pause),
            "resume" => Some(TimerAction::Resume),
            "stop" => Some(TimerAction::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters supplied by the collaborator that starts a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub mode: TimerMode,
    #[serde(default)]
    pub method_id: Option<String>,
    #[serde(default)]
    pub method_name: Option<String>,
    /// Countdown/interval only
    #[serde(default)]
    pub total_duration_secs: Option<f64>,
    /// Interval only
    #[serde(default)]
    pub interval_duration_secs: Option<f64>,
}

impl SessionConfig {
    pub fn stopwatch() -> Self {
        Self {
            mode: TimerMode::Stopwatch,
            method_id: None,
            method_name: None,
            total_duration_secs: None,
            interval_duration_secs: None,
        }
    }

    pub fn countdown(total_duration_secs: f64) -> Self {
        Self {
            mode: TimerMode::Countdown,
            total_duration_secs: Some(total_duration_secs),
            ..Self::stopwatch()
        }
    }

    pub fn interval(total_duration_secs: f64, interval_duration_secs: f64) -> Self {
        Self {
            mode: TimerMode::Interval,
            total_duration_secs: Some(total_duration_secs),
            interval_duration_secs: Some(interval_duration_secs),
            ..Self::stopwatch()
        }
    }

    pub fn with_method(mut self, method_id: &str, method_name: &str) -> Self {
        self.method_id = Some(method_id.to_string());
        self.method_name = Some(method_name.to_string());
        self
    }

    /// Countdown and interval sessions need a total to ever complete, and
    /// interval sessions need a period to place their boundaries
    pub fn validate(&self) -> Result<()> {
        let positive = |secs: Option<f64>| secs.is_some_and(|s| s.is_finite() && s > 0.0);
        let invalid = |reason: &'static str| TimerError::InvalidConfig { mode: self.mode, reason };

        match self.mode {
            TimerMode::Stopwatch => Ok(()),
            TimerMode::Countdown | TimerMode::Interval if !positive(self.total_duration_secs) => {
                Err(invalid("total duration must be a positive number of seconds"))
            }
            TimerMode::Interval if !positive(self.interval_duration_secs) => {
                Err(invalid("interval duration must be a positive number of seconds"))
            }
            TimerMode::Countdown | TimerMode::Interval => Ok(()),
        }
    }
}

/// The logical timer entity, owned by the host process while active.
///
/// While running, elapsed time is `now - started_at`; `started_at` is the
/// effective start reference and moves forward on every resume by the length
/// of the pause. While paused, elapsed time is `elapsed_at_last_checkpoint`
/// and `paused_at - started_at` equals it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSession {
    pub id: String,
    pub class: TimerClass,
    pub mode: TimerMode,
    pub method_id: Option<String>,
    pub method_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub total_duration: Option<f64>,
    pub interval_duration: Option<f64>,
    pub current_interval_index: Option<u32>,
    pub state: TimerState,
    pub elapsed_at_last_checkpoint: f64,
    pub paused_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default)]
    pub completion_fired: bool,
}

impl TimerSession {
    /// Create a running session that starts now
    pub fn start(class: TimerClass, config: &SessionConfig, now: DateTime<Utc>) -> Self {
        let total_duration = match config.mode {
            TimerMode::Stopwatch => None,
            TimerMode::Countdown | TimerMode::Interval => config.total_duration_secs,
        };
        let interval_duration = match config.mode {
            TimerMode::Interval => config.interval_duration_secs.filter(|d| *d > 0.0),
            _ => None,
        };

        Self {
            id: Ulid::new().to_string(),
            class,
            mode: config.mode,
            method_id: config.method_id.clone(),
            method_name: config.method_name.clone(),
            started_at: now,
            total_duration,
            interval_duration,
            current_interval_index: interval_duration.map(|_| 0),
            state: TimerState::Running,
            elapsed_at_last_checkpoint: 0.0,
            paused_at: None,
            last_transition_at: now,
            completion_fired: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != TimerState::Stopped
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        match self.state {
            TimerState::Running => secs_between(self.started_at, now).max(0.0),
            TimerState::Paused | TimerState::Stopped => self.elapsed_at_last_checkpoint,
        }
    }

    /// Remaining time for countdown/interval sessions with a known total
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        self.total_duration
            .map(|total| (total - self.elapsed_secs(now)).max(0.0))
    }

    /// Zero-based index of the interval that contains `elapsed`
    pub fn interval_index_at(&self, elapsed: f64) -> Option<u32> {
        let interval = self.interval_duration?;
        let mut index = (elapsed.max(0.0) / interval).floor() as u32;
        if let Some(total) = self.total_duration {
            let last = ((total / interval).ceil() as u32).saturating_sub(1);
            index = index.min(last);
        }
        Some(index)
    }

    /// Refresh the derived interval index; returns true when it moved
    pub fn refresh_interval(&mut self, now: DateTime<Utc>) -> bool {
        let index = self.interval_index_at(self.elapsed_secs(now));
        if index != self.current_interval_index {
            self.current_interval_index = index;
            true
        } else {
            false
        }
    }

    /// Whether the session has run out of time and has not yet reported it
    pub fn completion_due(&self, now: DateTime<Utc>) -> bool {
        self.state == TimerState::Running
            && !self.completion_fired
            && matches!(self.remaining_secs(now), Some(remaining) if remaining <= 0.0)
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_state(TimerState::Running, "pause")?;
        self.elapsed_at_last_checkpoint = self.elapsed_secs(now);
        self.refresh_interval(now);
        self.paused_at = Some(now);
        self.state = TimerState::Paused;
        self.last_transition_at = now;
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_state(TimerState::Paused, "resume")?;
        let paused_at = self
            .paused_at
            .unwrap_or_else(|| add_secs(self.started_at, self.elapsed_at_last_checkpoint));
        let pause_window = secs_between(paused_at, now).max(0.0);
        self.started_at = add_secs(self.started_at, pause_window);
        self.paused_at = None;
        self.state = TimerState::Running;
        self.last_transition_at = now;
        Ok(())
    }

    /// Stop the session and return the elapsed time at the moment of stopping
    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<f64> {
        if self.state == TimerState::Stopped {
            return Err(self.invalid("stop"));
        }
        let elapsed = self.elapsed_secs(now);
        self.state = TimerState::Stopped;
        self.elapsed_at_last_checkpoint = 0.0;
        self.paused_at = None;
        self.current_interval_index = None;
        self.last_transition_at = now;
        Ok(elapsed)
    }

    /// Land the session in `paused` with the given elapsed time.
    ///
    /// Used by restore: the references are rebased on `now` so a later
    /// `resume` continues from exactly `elapsed`.
    pub fn rebase_paused(&mut self, elapsed: f64, now: DateTime<Utc>) {
        self.elapsed_at_last_checkpoint = elapsed;
        self.started_at = add_secs(now, -elapsed);
        self.paused_at = Some(now);
        self.state = TimerState::Paused;
        self.current_interval_index = self.interval_index_at(elapsed);
        self.last_transition_at = now;
    }

    fn expect_state(&self, expected: TimerState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> TimerError {
        TimerError::InvalidTransition {
            class: self.class,
            operation,
            state: self.state,
        }
    }
}
