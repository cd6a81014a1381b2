//! Local notification ladder used while the host process is not executing
//!
//! Alerts are planned analytically from a [`BackgroundSnapshot`]: every title is
//! computed for the instant the alert will fire, because nothing runs at fire
//! time to re-query the timer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, TimerError},
    persistence::{read_json_lenient, snapshot::BackgroundSnapshot, write_json_atomic},
    state::{TimerClass, TimerMode},
    utils::{clock::add_secs, format::format_clock},
};

/// Identifier prefixes owned by the timer; cancellation removes all of them.
pub const TIMER_ALERT_PREFIXES: [&str; 2] = ["timer_", "interval_"];

/// Below this many seconds left, the session is treated as about to complete.
const ABOUT_TO_COMPLETE_SECS: f64 = 3.0;
const LONG_SESSION_SECS: f64 = 3600.0;
const UPCOMING_INTERVAL_ALERTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSound {
    Default,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledAlert {
    pub id: String,
    /// The class whose ladder owns the alert; ids are only unique per class
    #[serde(default)]
    pub class: Option<TimerClass>,
    pub title: String,
    pub body: String,
    /// Seconds after the reference instant (usually the snapshot's exit time)
    pub offset_secs: f64,
    pub fire_at: DateTime<Utc>,
    pub sound: AlertSound,
}

impl ScheduledAlert {
    fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        from: DateTime<Utc>,
        offset_secs: f64,
        sound: AlertSound,
    ) -> Self {
        Self {
            id: id.into(),
            class: None,
            title: title.into(),
            body: body.into(),
            offset_secs,
            fire_at: add_secs(from, offset_secs),
            sound,
        }
    }

    fn for_class(mut self, class: TimerClass) -> Self {
        self.class = Some(class);
        self
    }

    fn is_timer_alert(&self) -> bool {
        TIMER_ALERT_PREFIXES.iter().any(|prefix| self.id.starts_with(prefix))
    }
}

/// Plan the full alert ladder for a session that just went to the background
pub fn plan_ladder(snapshot: &BackgroundSnapshot) -> Vec<ScheduledAlert> {
    let exit = snapshot.exit_time;
    let session = &snapshot.session;
    let remaining = snapshot.remaining_at_exit();
    let outlasts = |offset: f64| remaining.map_or(true, |r| r > offset);
    let method = session.method_name.as_deref();

    let mut alerts = Vec::new();

    if let Some(remaining) = remaining.filter(|r| *r > 0.0) {
        alerts.push(ScheduledAlert::new(
            "timer_countdown_complete",
            "Timer Complete!",
            match method {
                Some(name) => format!("Your {} timer has finished", name),
                None => "Your countdown timer has finished".to_string(),
            },
            exit,
            remaining,
            AlertSound::Critical,
        ));
    }

    if outlasts(ABOUT_TO_COMPLETE_SECS) {
        alerts.push(ScheduledAlert::new(
            "timer_running_immediate",
            "Timer Still Running",
            match method {
                Some(name) => format!("Your {} session is still active", name),
                None => "Your practice session is still active".to_string(),
            },
            exit,
            ABOUT_TO_COMPLETE_SECS,
            AlertSound::Critical,
        ));

        if outlasts(30.0) {
            alerts.push(ScheduledAlert::new(
                "timer_running_30sec",
                "Timer Active",
                "Your session continues in the background",
                exit,
                30.0,
                AlertSound::Default,
            ));
        }

        for minutes in (2..=10).step_by(2) {
            let offset = f64::from(minutes * 60);
            if outlasts(offset) {
                alerts.push(ScheduledAlert::new(
                    format!("timer_running_{}min", minutes),
                    progress_title(snapshot, offset),
                    "Tap to return to your session",
                    exit,
                    offset,
                    AlertSound::Default,
                ));
            }
        }
    }

    for minutes in (15..=60).step_by(5) {
        let offset = f64::from(minutes * 60);
        if outlasts(offset) {
            alerts.push(ScheduledAlert::new(
                format!("timer_running_{}min_long", minutes),
                progress_title(snapshot, offset),
                "Your session is still running",
                exit,
                offset,
                AlertSound::Default,
            ));
        }
    }

    if session.mode == TimerMode::Interval {
        if let Some(interval) = session.interval_duration {
            let into_interval = snapshot.elapsed_at_exit() % interval;
            let to_next_boundary = interval - into_interval;
            let current = session
                .interval_index_at(snapshot.elapsed_at_exit())
                .unwrap_or(0);

            for k in 0..UPCOMING_INTERVAL_ALERTS {
                let offset = to_next_boundary + f64::from(k) * interval;
                if !outlasts(offset) {
                    break;
                }
                let number = current + 1 + k;
                alerts.push(ScheduledAlert::new(
                    format!("interval_{}", number),
                    format!("Interval {} Complete", number),
                    "Time to switch! Tap to continue your session.",
                    exit,
                    offset,
                    AlertSound::Default,
                ));
            }
        }
    }

    if outlasts(LONG_SESSION_SECS) {
        alerts.push(ScheduledAlert::new(
            "timer_running_1hour",
            "Long Session Alert",
            "Your timer has been running for over an hour. Tap to check your progress.",
            exit,
            LONG_SESSION_SECS,
            AlertSound::Critical,
        ));
    }

    let class = snapshot.class();
    alerts.into_iter().map(|alert| alert.for_class(class)).collect()
}

fn progress_title(snapshot: &BackgroundSnapshot, offset: f64) -> String {
    let elapsed = snapshot.elapsed_at(add_secs(snapshot.exit_time, offset));
    match (snapshot.session.mode, snapshot.session.total_duration) {
        (TimerMode::Countdown, Some(total)) => {
            format!("Timer {} remaining", format_clock((total - elapsed).max(0.0)))
        }
        _ => format!("Timer {} elapsed", format_clock(elapsed)),
    }
}

/// The local notification surface.
pub trait NotificationSink: Send + Sync {
    fn schedule(&self, alert: &ScheduledAlert) -> Result<()>;
    fn pending(&self) -> Vec<ScheduledAlert>;
    fn delivered(&self) -> Vec<ScheduledAlert>;
    /// Remove pending and delivered alerts of `class` with these identifiers
    fn remove(&self, class: Option<TimerClass>, ids: &[String]) -> Result<()>;
    /// Hand every alert whose fire time has passed to the user
    fn deliver_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledAlert>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SpoolFile {
    pending: Vec<ScheduledAlert>,
    delivered: Vec<ScheduledAlert>,
}

/// Alerts spooled for an OS notifier, optionally backed by `notifications.json`.
///
/// Create with [`NotificationSpool::open`] to persist, or
/// [`NotificationSpool::new_in_memory`] for tests.
#[derive(Debug)]
pub struct NotificationSpool {
    state: Mutex<SpoolFile>,
    file_path: Option<PathBuf>,
}

impl NotificationSpool {
    pub fn new_in_memory() -> Self {
        Self {
            state: Mutex::new(SpoolFile::default()),
            file_path: None,
        }
    }

    pub fn open(dir: &Path) -> Result<Self> {
        let file_path = dir.join("notifications.json");
        let state = read_json_lenient(&file_path)?.unwrap_or_default();
        Ok(Self {
            state: Mutex::new(state),
            file_path: Some(file_path),
        })
    }

    fn update<T>(&self, apply: impl FnOnce(&mut SpoolFile) -> T) -> Result<T> {
        let mut spool = self
            .state
            .lock()
            .map_err(|e| TimerError::Notification(format!("Failed to lock spool: {}", e)))?;
        let result = apply(&mut spool);
        if let Some(path) = &self.file_path {
            write_json_atomic(path, &*spool)?;
        }
        Ok(result)
    }

    fn read<T>(&self, view: impl FnOnce(&SpoolFile) -> T) -> T
    where
        T: Default,
    {
        self.state.lock().map(|spool| view(&spool)).unwrap_or_default()
    }
}

impl NotificationSink for NotificationSpool {
    fn schedule(&self, alert: &ScheduledAlert) -> Result<()> {
        self.update(|spool| {
            spool
                .pending
                .retain(|existing| existing.id != alert.id || existing.class != alert.class);
            spool.pending.push(alert.clone());
        })
    }

    fn pending(&self) -> Vec<ScheduledAlert> {
        self.read(|spool| spool.pending.clone())
    }

    fn delivered(&self) -> Vec<ScheduledAlert> {
        self.read(|spool| spool.delivered.clone())
    }

    fn remove(&self, class: Option<TimerClass>, ids: &[String]) -> Result<()> {
        let targeted = |alert: &ScheduledAlert| alert.class == class && ids.contains(&alert.id);
        self.update(|spool| {
            spool.pending.retain(|alert| !targeted(alert));
            spool.delivered.retain(|alert| !targeted(alert));
        })
    }

    /// Move every alert whose fire time has passed from pending to delivered
    fn deliver_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledAlert>> {
        self.update(|spool| {
            let (due, waiting): (Vec<_>, Vec<_>) =
                spool.pending.drain(..).partition(|alert| alert.fire_at <= now);
            spool.pending = waiting;
            spool.delivered.extend(due.iter().cloned());
            due
        })
    }
}

/// Schedules and cancels the timer's alerts; failures are logged, never raised.
#[derive(Clone)]
pub struct NotificationScheduler {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationScheduler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }

    /// Deliver due alerts, logging each one
    pub fn deliver_due(&self, now: DateTime<Utc>) -> usize {
        match self.sink.deliver_due(now) {
            Ok(delivered) => {
                for alert in &delivered {
                    info!("Notification '{}': {}", alert.id, alert.title);
                }
                delivered.len()
            }
            Err(e) => {
                warn!("Failed to deliver notifications: {}", e);
                0
            }
        }
    }

    /// Replace the class's previous ladder with a fresh one for `snapshot`
    pub fn schedule_ladder(&self, snapshot: &BackgroundSnapshot) -> usize {
        self.cancel(snapshot.class());

        let alerts = plan_ladder(snapshot);
        let mut scheduled = 0;
        for alert in &alerts {
            match self.sink.schedule(alert) {
                Ok(()) => scheduled += 1,
                Err(e) => warn!("Failed to schedule notification '{}': {}", alert.id, e),
            }
        }
        info!(
            "Scheduled {} of {} background alerts for {} session",
            scheduled,
            alerts.len(),
            snapshot.class()
        );
        scheduled
    }

    /// Remove the class's pending and delivered timer alerts
    pub fn cancel(&self, class: TimerClass) {
        let ids: Vec<String> = self
            .sink
            .pending()
            .into_iter()
            .chain(self.sink.delivered())
            .filter(|alert| alert.class == Some(class) && alert.is_timer_alert())
            .map(|alert| alert.id)
            .collect();

        if ids.is_empty() {
            return;
        }
        match self.sink.remove(Some(class), &ids) {
            Ok(()) => debug!("Cancelled {} {} timer notifications", ids.len(), class),
            Err(e) => warn!("Failed to cancel {} timer notifications: {}", class, e),
        }
    }

    /// Tell the user a session finished while the host was away
    pub fn post_completion_notice(&self, class: TimerClass, method_name: Option<&str>, now: DateTime<Utc>) {
        let alert = ScheduledAlert::new(
            "timer_completion_background",
            "Session Complete!",
            match method_name {
                Some(name) => format!("Your {} session finished while you were away", name),
                None => "Your practice session finished while you were away".to_string(),
            },
            now,
            0.1,
            AlertSound::Critical,
        )
        .for_class(class);
        if let Err(e) = self.sink.schedule(&alert) {
            warn!("Failed to post completion notice: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SessionConfig, TimerClass, TimerSession};
    use crate::utils::clock::{Clock, ManualClock};

    fn snapshot_after(config: SessionConfig, elapsed: f64) -> BackgroundSnapshot {
        snapshot_of(TimerClass::Primary, config, elapsed)
    }

    fn snapshot_of(class: TimerClass, config: SessionConfig, elapsed: f64) -> BackgroundSnapshot {
        let clock = ManualClock::at_epoch();
        let session = TimerSession::start(class, &config, clock.now());
        clock.advance_secs(elapsed);
        BackgroundSnapshot::capture(&session, clock.now())
    }

    fn ids(alerts: &[ScheduledAlert]) -> Vec<&str> {
        alerts.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn test_stopwatch_ladder() {
        let alerts = plan_ladder(&snapshot_after(SessionConfig::stopwatch(), 50.0));
        let ids = ids(&alerts);

        assert!(!ids.contains(&"timer_countdown_complete"));
        assert!(ids.contains(&"timer_running_immediate"));
        assert!(ids.contains(&"timer_running_30sec"));
        for minutes in [2, 4, 6, 8, 10] {
            assert!(ids.contains(&format!("timer_running_{}min", minutes).as_str()));
        }
        for minutes in (15..=60).step_by(5) {
            assert!(ids.contains(&format!("timer_running_{}min_long", minutes).as_str()));
        }
        assert!(ids.contains(&"timer_running_1hour"));
        assert_eq!(alerts.len(), 1 + 1 + 5 + 10 + 1);

        let two_min = alerts.iter().find(|a| a.id == "timer_running_2min").unwrap();
        assert_eq!(two_min.title, "Timer 2:50 elapsed");
    }

    #[test]
    fn test_countdown_ladder_is_suppressed_past_completion() {
        let snapshot = snapshot_after(SessionConfig::countdown(600.0), 100.0);
        let alerts = plan_ladder(&snapshot);
        let ids = ids(&alerts);

        let complete = alerts.iter().find(|a| a.id == "timer_countdown_complete").unwrap();
        assert_eq!(complete.offset_secs, 500.0);
        assert_eq!(complete.fire_at, add_secs(snapshot.exit_time, 500.0));

        assert!(ids.contains(&"timer_running_8min"));
        assert!(!ids.contains(&"timer_running_10min"));
        assert!(!ids.contains(&"timer_running_15min_long"));
        assert!(!ids.contains(&"timer_running_1hour"));

        let four_min = alerts.iter().find(|a| a.id == "timer_running_4min").unwrap();
        assert_eq!(four_min.title, "Timer 4:20 remaining");
    }

    #[test]
    fn test_about_to_complete_skips_awareness_alerts() {
        let alerts = plan_ladder(&snapshot_after(SessionConfig::countdown(60.0), 58.0));
        assert_eq!(ids(&alerts), vec!["timer_countdown_complete"]);
    }

    #[test]
    fn test_interval_boundaries() {
        let alerts = plan_ladder(&snapshot_after(SessionConfig::interval(3600.0, 300.0), 420.0));
        let boundaries: Vec<(&str, f64)> = alerts
            .iter()
            .filter(|a| a.id.starts_with("interval_"))
            .map(|a| (a.id.as_str(), a.offset_secs))
            .collect();

        assert_eq!(
            boundaries,
            vec![
                ("interval_2", 180.0),
                ("interval_3", 480.0),
                ("interval_4", 780.0),
                ("interval_5", 1080.0),
                ("interval_6", 1380.0),
            ]
        );
    }

    #[test]
    fn test_interval_boundaries_stop_at_session_end() {
        let alerts = plan_ladder(&snapshot_after(SessionConfig::interval(600.0, 300.0), 100.0));
        let boundaries: Vec<&str> = alerts
            .iter()
            .filter(|a| a.id.starts_with("interval_"))
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(boundaries, vec!["interval_1"]);
    }

    #[test]
    fn test_reschedule_replaces_previous_ladder() {
        let spool = Arc::new(NotificationSpool::new_in_memory());
        let scheduler = NotificationScheduler::new(spool.clone());

        scheduler.schedule_ladder(&snapshot_after(SessionConfig::stopwatch(), 0.0));
        let first = spool.pending().len();
        scheduler.schedule_ladder(&snapshot_after(SessionConfig::countdown(120.0), 0.0));

        assert!(spool.pending().len() < first);
        assert!(spool.pending().iter().any(|a| a.id == "timer_countdown_complete"));
    }

    #[test]
    fn test_ladders_are_kept_per_class() {
        let spool = Arc::new(NotificationSpool::new_in_memory());
        let scheduler = NotificationScheduler::new(spool.clone());
        let quick = snapshot_of(TimerClass::Quick, SessionConfig::stopwatch(), 0.0);
        scheduler.schedule_ladder(&quick);
        let quick_alerts = spool.pending().len();

        scheduler.schedule_ladder(&snapshot_of(TimerClass::Primary, SessionConfig::countdown(120.0), 0.0));
        scheduler.schedule_ladder(&snapshot_of(TimerClass::Primary, SessionConfig::countdown(90.0), 0.0));

        let pending = spool.pending();
        let of = |class| pending.iter().filter(|a| a.class == Some(class)).count();
        assert_eq!(of(TimerClass::Quick), quick_alerts);
        let latest = plan_ladder(&snapshot_of(TimerClass::Primary, SessionConfig::countdown(90.0), 0.0));
        assert_eq!(of(TimerClass::Primary), latest.len());

        scheduler.cancel(TimerClass::Primary);
        assert!(spool.pending().iter().all(|a| a.class == Some(TimerClass::Quick)));
        assert_eq!(spool.pending().len(), quick_alerts);
    }

    #[test]
    fn test_cancel_removes_pending_and_delivered_timer_alerts() {
        let spool = Arc::new(NotificationSpool::new_in_memory());
        let scheduler = NotificationScheduler::new(spool.clone());
        let snapshot = snapshot_after(SessionConfig::stopwatch(), 0.0);
        scheduler.schedule_ladder(&snapshot);

        let unrelated = ScheduledAlert::new(
            "streak_reminder",
            "Streak",
            "",
            snapshot.exit_time,
            10.0,
            AlertSound::Default,
        );
        spool.schedule(&unrelated).unwrap();

        let delivered = spool.deliver_due(add_secs(snapshot.exit_time, 31.0)).unwrap();
        assert_eq!(delivered.len(), 3);
        assert!(delivered.iter().any(|a| a.id == "streak_reminder"));

        scheduler.cancel(TimerClass::Primary);
        assert!(spool.pending().is_empty());
        assert_eq!(ids(&spool.delivered()), vec!["streak_reminder"]);
    }

    #[test]
    fn test_file_spool_survives_reopen() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let snapshot = snapshot_after(SessionConfig::stopwatch(), 0.0);
        {
            let spool = Arc::new(NotificationSpool::open(temp_dir.path()).unwrap());
            NotificationScheduler::new(spool).schedule_ladder(&snapshot);
        }
        let reopened = NotificationSpool::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.pending().len(), plan_ladder(&snapshot).len());
    }
}
