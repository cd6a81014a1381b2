//! Periodic, self re-arming background wakes
//!
//! Two wakes exist: a refresh wake every 15 minutes and a processing wake
//! timed from the expected session length. Both are best-effort and each
//! handler re-arms itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::Notify, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    services::live_surface::LiveSurface,
    state::AppState,
    utils::clock::{add_secs, secs_between, Clock},
};

pub const REFRESH_INTERVAL_SECS: f64 = 15.0 * 60.0;
pub const MAX_PROCESSING_DELAY_SECS: f64 = 30.0 * 60.0;
/// Expected length used for open-ended sessions
pub const DEFAULT_EXPECTED_DURATION_SECS: f64 = 60.0 * 60.0;
pub const WAKE_BUDGET: Duration = Duration::from_secs(30);

/// Upper bound on a single sleep, so wall-clock jumps are noticed
const MAX_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeKind {
    Refresh,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWake {
    pub kind: WakeKind,
    pub due_at: DateTime<Utc>,
}

/// At most one pending wake per kind; arming a kind again replaces it.
#[derive(Debug, Default)]
pub struct WakeScheduler {
    pending: Mutex<HashMap<WakeKind, DateTime<Utc>>>,
    changed: Notify,
}

impl WakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_refresh(&self, now: DateTime<Utc>) {
        self.arm(WakeKind::Refresh, add_secs(now, REFRESH_INTERVAL_SECS));
    }

    /// Arm the processing wake at half the expected duration, capped at 30 minutes
    pub fn schedule_processing(&self, now: DateTime<Utc>, expected_duration_secs: Option<f64>) {
        let expected = expected_duration_secs
            .filter(|d| *d > 0.0)
            .unwrap_or(DEFAULT_EXPECTED_DURATION_SECS);
        let delay = (expected / 2.0).min(MAX_PROCESSING_DELAY_SECS);
        self.arm(WakeKind::Processing, add_secs(now, delay));
    }

    pub fn cancel_all(&self) {
        let mut pending = self.lock();
        if !pending.is_empty() {
            info!("Cancelling {} background wakes", pending.len());
            pending.clear();
        }
        drop(pending);
        self.changed.notify_one();
    }

    pub fn pending(&self) -> Vec<PendingWake> {
        let mut wakes: Vec<PendingWake> = self
            .lock()
            .iter()
            .map(|(kind, due_at)| PendingWake {
                kind: *kind,
                due_at: *due_at,
            })
            .collect();
        wakes.sort_by_key(|w| w.due_at);
        wakes
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().values().min().copied()
    }

    /// Remove and return every wake due at `now`
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<WakeKind> {
        let mut pending = self.lock();
        let mut due: Vec<(WakeKind, DateTime<Utc>)> = pending
            .iter()
            .filter(|(_, due_at)| **due_at <= now)
            .map(|(kind, due_at)| (*kind, *due_at))
            .collect();
        due.sort_by_key(|(_, due_at)| *due_at);
        for (kind, _) in &due {
            pending.remove(kind);
        }
        due.into_iter().map(|(kind, _)| kind).collect()
    }

    fn arm(&self, kind: WakeKind, due_at: DateTime<Utc>) {
        debug!("Arming {:?} wake for {}", kind, due_at);
        self.lock().insert(kind, due_at);
        self.changed.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WakeKind, DateTime<Utc>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run the handler for one wake
pub async fn handle_wake(state: &AppState, kind: WakeKind) {
    let now = state.clock().now();
    match kind {
        WakeKind::Refresh => {
            state.wake().schedule_refresh(now);
            if !state.mirror().is_authenticated() {
                return;
            }
            for class in state.active_classes() {
                if let Err(e) = state.force_sync(class) {
                    debug!("Refresh wake skipped {}: {}", class, e);
                }
            }
        }
        WakeKind::Processing => {
            if !state.mirror().is_authenticated() {
                debug!("Processing wake without an authenticated user, nothing to do");
                return;
            }
            let classes = state.surface().active_classes();
            for class in &classes {
                if let Err(e) = state.force_sync(*class) {
                    debug!("Processing wake skipped {}: {}", class, e);
                }
            }
            if !classes.is_empty() {
                state
                    .wake()
                    .schedule_processing(now, Some(DEFAULT_EXPECTED_DURATION_SECS));
            }
        }
    }
}

/// Run a wake handler under `budget`; on timeout the wake is re-armed before giving up
pub async fn run_with_budget(state: &AppState, kind: WakeKind, budget: Duration) {
    if timeout(budget, handle_wake(state, kind)).await.is_err() {
        warn!("{:?} wake exceeded its {:?} budget, re-arming", kind, budget);
        let now = state.clock().now();
        match kind {
            WakeKind::Refresh => state.wake().schedule_refresh(now),
            WakeKind::Processing => state.wake().schedule_processing(now, None),
        }
    }
}

/// Background task that fires due wakes
pub async fn wake_task(state: Arc<AppState>) {
    info!("Starting background wake task");

    loop {
        let now = state.clock().now();
        for kind in state.wake().take_due(now) {
            info!("Background {:?} wake", kind);
            run_with_budget(&state, kind, WAKE_BUDGET).await;
        }

        let sleep_for = match state.wake().next_due() {
            Some(due_at) => Duration::from_secs_f64(secs_between(now, due_at).max(0.0)).min(MAX_SLEEP),
            None => MAX_SLEEP,
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = state.wake().changed.notified() => {
                debug!("Wake schedule changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::app_state::testing::harness;
    use crate::state::{SessionConfig, TimerClass};
    use crate::utils::clock::ManualClock;

    #[test]
    fn test_processing_delay_is_half_the_session_capped() {
        let clock = ManualClock::at_epoch();
        let scheduler = WakeScheduler::new();

        scheduler.schedule_processing(clock.now(), Some(600.0));
        assert_eq!(scheduler.next_due(), Some(add_secs(clock.now(), 300.0)));

        scheduler.schedule_processing(clock.now(), None);
        assert_eq!(scheduler.next_due(), Some(add_secs(clock.now(), MAX_PROCESSING_DELAY_SECS)));

        scheduler.schedule_processing(clock.now(), Some(4.0 * 3600.0));
        assert_eq!(scheduler.next_due(), Some(add_secs(clock.now(), MAX_PROCESSING_DELAY_SECS)));
    }

    #[test]
    fn test_take_due_removes_only_due_wakes() {
        let clock = ManualClock::at_epoch();
        let scheduler = WakeScheduler::new();
        scheduler.schedule_processing(clock.now(), Some(120.0));
        scheduler.schedule_refresh(clock.now());

        clock.advance_secs(60.0);
        assert_eq!(scheduler.take_due(clock.now()), vec![WakeKind::Processing]);
        assert_eq!(scheduler.pending().len(), 1);

        scheduler.cancel_all();
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_wake_rearms_and_syncs_active_sessions() {
        let mut h = harness();
        let session = h
            .state
            .start_session(TimerClass::Primary, &SessionConfig::stopwatch())
            .unwrap();
        h.worker.drain().await;

        h.clock.advance_secs(REFRESH_INTERVAL_SECS);
        handle_wake(&h.state, WakeKind::Refresh).await;
        h.worker.drain().await;

        assert_eq!(h.mirror_backend.pushes(), vec![session.id]);
        let refresh = h
            .state
            .wake()
            .pending()
            .into_iter()
            .find(|w| w.kind == WakeKind::Refresh)
            .unwrap();
        assert_eq!(refresh.due_at, add_secs(h.clock.now(), REFRESH_INTERVAL_SECS));
    }

    #[tokio::test]
    async fn test_processing_wake_reschedules_while_surface_is_active() {
        let mut h = harness();
        h.state
            .start_session(TimerClass::Quick, &SessionConfig::countdown(1200.0))
            .unwrap();
        h.state.wake().cancel_all();

        handle_wake(&h.state, WakeKind::Processing).await;
        h.worker.drain().await;

        assert_eq!(h.mirror_backend.pushes().len(), 1);
        assert_eq!(
            h.state.wake().next_due(),
            Some(add_secs(h.clock.now(), MAX_PROCESSING_DELAY_SECS))
        );

        h.state.stop_session(TimerClass::Quick).unwrap();
        handle_wake(&h.state, WakeKind::Processing).await;
        assert!(h.state.wake().pending().is_empty());
    }
}
