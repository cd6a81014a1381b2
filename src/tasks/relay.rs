//! Relay of control actions issued on the live surface
//!
//! Delivery has two phases. A payload-less signal (or the poll tick) says
//! "look now"; the action itself is read from the side-channel. Validation
//! against a time window and a per-class watermark makes processing
//! idempotent, whichever phase triggered it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{
    error::{RelayRejection, Result, TimerError},
    persistence::{CompletionRecord, PendingAction},
    services::live_surface::LiveSurface,
    state::{AppState, TimerAction, TimerClass, TimerState},
    utils::clock::{secs_between, Clock},
};

pub const DEFAULT_ACTION_WINDOW_SECS: f64 = 10.0;

/// Reads, validates and dispatches pending actions into the state machine
pub struct ActionRelay {
    state: Arc<AppState>,
    window_secs: f64,
    /// Timestamp of the last action accepted per class
    watermarks: Mutex<HashMap<TimerClass, DateTime<Utc>>>,
}

impl ActionRelay {
    pub fn new(state: Arc<AppState>, window_secs: f64) -> Self {
        Self {
            state,
            window_secs,
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// Drain the side-channel once; returns how many actions changed state.
    ///
    /// Every class's slot is read, and each action is dispatched on its own
    /// class. A surface stop ends that class's surface before the host sees
    /// the action, so the surface only confirms the class, never gates it.
    pub fn process(&self) -> usize {
        let shown = self.state.surface().active_classes();

        let mut applied = 0;
        for slot in TimerClass::ALL {
            let Some(action) = self.state.side_channel().take(slot) else {
                continue;
            };
            let class = action.timer_type;
            if !shown.contains(&class) {
                debug!("Surface no longer shows {}, relaying {} by its own class", class, action.action);
            }
            match self.accept(&action) {
                Ok(()) => match self.dispatch(&action) {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Relayed {} for {} failed: {}", action.action, class, e),
                },
                Err(e @ TimerError::RelayValidation { reason: RelayRejection::AlreadyProcessed, .. }) => {
                    debug!("{}", e)
                }
                Err(e) => warn!("{}", e),
            }
        }
        applied
    }

    /// Check the window and the watermark, advancing the watermark on success
    fn accept(&self, action: &PendingAction) -> Result<()> {
        let class = action.timer_type;
        let now = self.state.clock().now();
        let reject = |reason| TimerError::RelayValidation {
            class,
            action: action.action,
            reason,
        };

        let age = secs_between(action.timestamp, now);
        if age > self.window_secs {
            return Err(reject(RelayRejection::Expired));
        }
        // A skewed surface clock must not push the watermark past later actions
        if -age > self.window_secs {
            return Err(reject(RelayRejection::FromFuture));
        }

        let mut watermarks = self.watermarks.lock().unwrap_or_else(PoisonError::into_inner);
        if watermarks.get(&class).is_some_and(|last| action.timestamp <= *last) {
            return Err(reject(RelayRejection::AlreadyProcessed));
        }
        watermarks.insert(class, action.timestamp);
        Ok(())
    }

    /// Apply the action if the session is in a state that accepts it
    fn dispatch(&self, action: &PendingAction) -> Result<bool> {
        let class = action.timer_type;
        let current = self.state.session_state(class);

        match (action.action, current) {
            (TimerAction::Pause, TimerState::Running) => {
                self.state.pause_session(class)?;
            }
            (TimerAction::Resume, TimerState::Paused) => {
                self.state.resume_session(class)?;
            }
            (TimerAction::Stop, TimerState::Running | TimerState::Paused) => {
                self.stop_from_surface(class)?;
            }
            (requested, state) => {
                info!("Ignoring relayed {} for {} session in state {}", requested, class, state);
                return Ok(false);
            }
        }

        info!(
            "Relayed {} for {} (correlation {})",
            action.action, class, action.correlation_id
        );
        Ok(true)
    }

    /// The snapshot goes first, so a restore racing this stop finds nothing
    fn stop_from_surface(&self, class: TimerClass) -> Result<()> {
        if let Err(e) = self.state.tracker().clear(class) {
            warn!("Failed to clear {} snapshot before relayed stop: {}", class, e);
        }

        if let Some(view) = self.state.session_view(class) {
            if view.elapsed_secs > 0.0 {
                let record = CompletionRecord {
                    elapsed_secs: view.elapsed_secs,
                    started_at: view.session.started_at,
                    method_name: view
                        .session
                        .method_name
                        .clone()
                        .unwrap_or_else(|| "Practice".to_string()),
                    timestamp: self.state.clock().now(),
                };
                if let Err(e) = self.state.side_channel().store_completion(class, &record) {
                    warn!("Failed to store completion record for {}: {}", class, e);
                }
            }
        }

        self.state.stop_session(class).map(|_| ())
    }
}

/// Background task that drives the relay from signals and a poll tick
pub async fn relay_task(relay: Arc<ActionRelay>, poll_interval: Duration) {
    info!("Starting action relay, polling every {:?}", poll_interval);

    let mut signals = relay.state.signals().subscribe();
    let mut interval = tokio::time::interval(poll_interval);

    loop {
        let woken_by = tokio::select! {
            _ = interval.tick() => None,
            signal = signals.recv() => Some(signal),
        };

        match woken_by {
            None => {}
            Some(Ok(signal)) => debug!("Relay woken by {}", signal.channel_name()),
            Some(Err(RecvError::Lagged(missed))) => debug!("Relay missed {} signals", missed),
            Some(Err(RecvError::Closed)) => {
                warn!("Signal bus closed, resubscribing");
                signals = relay.state.signals().subscribe();
            }
        }
        relay.process();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::app_state::testing::{harness, Harness};
    use crate::state::SessionConfig;
    use crate::utils::clock::add_secs;

    fn relay(h: &Harness) -> ActionRelay {
        ActionRelay::new(h.state.clone(), DEFAULT_ACTION_WINDOW_SECS)
    }

    fn post(h: &Harness, action: TimerAction, class: TimerClass) -> PendingAction {
        let activity = h.state.session(class).map(|s| s.id).unwrap_or_default();
        let pending = PendingAction::new(action, class, &activity, h.clock.now());
        h.state.side_channel().post(&pending).unwrap();
        pending
    }

    #[test]
    fn test_same_action_applies_once() {
        let h = harness();
        let relay = relay(&h);
        h.state
            .start_session(TimerClass::Primary, &SessionConfig::stopwatch())
            .unwrap();
        h.clock.advance_secs(5.0);

        let pending = post(&h, TimerAction::Pause, TimerClass::Primary);
        assert_eq!(relay.process(), 1);
        assert_eq!(h.state.session_state(TimerClass::Primary), TimerState::Paused);

        // Redelivered with the same timestamp after the user resumed locally
        h.state.resume_session(TimerClass::Primary).unwrap();
        h.state.side_channel().post(&pending).unwrap();
        assert_eq!(relay.process(), 0);
        assert_eq!(h.state.session_state(TimerClass::Primary), TimerState::Running);
    }

    #[test]
    fn test_expired_action_is_rejected() {
        let h = harness();
        let relay = relay(&h);
        h.state
            .start_session(TimerClass::Primary, &SessionConfig::stopwatch())
            .unwrap();

        post(&h, TimerAction::Pause, TimerClass::Primary);
        h.clock.advance_secs(11.0);

        assert_eq!(relay.process(), 0);
        assert_eq!(h.state.session_state(TimerClass::Primary), TimerState::Running);
        assert!(h.state.side_channel().take(TimerClass::Primary).is_none());
    }

    #[test]
    fn test_resume_only_applies_to_paused_sessions() {
        let h = harness();
        let relay = relay(&h);
        h.state
            .start_session(TimerClass::Quick, &SessionConfig::stopwatch())
            .unwrap();

        post(&h, TimerAction::Resume, TimerClass::Quick);
        assert_eq!(relay.process(), 0);
        assert_eq!(h.state.session_state(TimerClass::Quick), TimerState::Running);
    }

    #[tokio::test]
    async fn test_stop_clears_snapshot_and_leaves_completion_record() {
        let mut h = harness();
        let relay = relay(&h);
        h.state
            .start_session(TimerClass::Primary, &SessionConfig::countdown(600.0).with_method("m1", "Scales"))
            .unwrap();
        h.clock.advance_secs(95.0);
        h.state.on_enter_background();
        assert!(h.state.tracker().has_snapshot(TimerClass::Primary));

        h.clock.advance_secs(3.0);
        post(&h, TimerAction::Stop, TimerClass::Primary);
        assert_eq!(relay.process(), 1);
        h.worker.drain().await;

        assert_eq!(h.state.session_state(TimerClass::Primary), TimerState::Stopped);
        assert!(!h.state.tracker().has_snapshot(TimerClass::Primary));
        assert!(h.mirror_backend.document("user-1").is_none());
        assert!(h.state.on_enter_foreground().is_empty());

        let record = h
            .state
            .take_pending_completion(TimerClass::Primary)
            .unwrap()
            .unwrap();
        assert_eq!(record.elapsed_secs, 98.0);
        assert_eq!(record.method_name, "Scales");
    }

    #[test]
    fn test_stop_for_class_no_longer_on_surface_is_applied() {
        let h = harness();
        let relay = relay(&h);
        h.state
            .start_session(TimerClass::Primary, &SessionConfig::stopwatch())
            .unwrap();
        h.state
            .start_session(TimerClass::Quick, &SessionConfig::stopwatch())
            .unwrap();
        h.clock.advance_secs(4.0);

        // The surface ends its own view of the class when stop is tapped
        h.surface.end(TimerClass::Quick).unwrap();
        post(&h, TimerAction::Stop, TimerClass::Quick);

        assert_eq!(relay.process(), 1);
        assert_eq!(h.state.session_state(TimerClass::Quick), TimerState::Stopped);
        assert_eq!(h.state.session_state(TimerClass::Primary), TimerState::Running);
    }

    #[test]
    fn test_action_from_the_future_is_rejected_without_moving_watermark() {
        let h = harness();
        let relay = relay(&h);
        h.state
            .start_session(TimerClass::Primary, &SessionConfig::stopwatch())
            .unwrap();
        let activity = h.state.session(TimerClass::Primary).unwrap().id;

        let skewed = PendingAction::new(
            TimerAction::Pause,
            TimerClass::Primary,
            &activity,
            add_secs(h.clock.now(), 60.0),
        );
        h.state.side_channel().post(&skewed).unwrap();
        assert_eq!(relay.process(), 0);
        assert_eq!(h.state.session_state(TimerClass::Primary), TimerState::Running);

        h.clock.advance_secs(1.0);
        post(&h, TimerAction::Pause, TimerClass::Primary);
        assert_eq!(relay.process(), 1);
        assert_eq!(h.state.session_state(TimerClass::Primary), TimerState::Paused);
    }

    #[test]
    fn test_small_clock_skew_is_tolerated() {
        let h = harness();
        let relay = relay(&h);
        h.state
            .start_session(TimerClass::Quick, &SessionConfig::stopwatch())
            .unwrap();
        let activity = h.state.session(TimerClass::Quick).unwrap().id;

        let ahead = PendingAction::new(
            TimerAction::Pause,
            TimerClass::Quick,
            &activity,
            add_secs(h.clock.now(), 3.0),
        );
        h.state.side_channel().post(&ahead).unwrap();
        assert_eq!(relay.process(), 1);
        assert_eq!(h.state.session_state(TimerClass::Quick), TimerState::Paused);
    }
}
