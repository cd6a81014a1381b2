//! Registry of timer sessions keyed by timer class

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::session::{SessionConfig, TimerClass, TimerSession, TimerState};
use crate::error::{Result, TimerError};

/// Outcome of a stop or completion: the session as it was just before it
/// stopped, plus the elapsed time at that moment.
#[derive(Debug, Clone)]
pub struct FinishedSession {
    pub session: TimerSession,
    pub elapsed_secs: f64,
}

/// Holds at most one active session per timer class.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<TimerClass, TimerSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: TimerClass) -> Option<&TimerSession> {
        self.sessions.get(&class)
    }

    pub fn is_active(&self, class: TimerClass) -> bool {
        self.sessions.get(&class).is_some_and(|s| s.is_active())
    }

    /// Classes that currently hold a running or paused session
    pub fn active_classes(&self) -> Vec<TimerClass> {
        let mut classes: Vec<TimerClass> = self
            .sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.class)
            .collect();
        classes.sort();
        classes
    }

    pub fn start(&mut self, class: TimerClass, config: &SessionConfig, now: DateTime<Utc>) -> Result<TimerSession> {
        config.validate()?;
        if self.is_active(class) {
            return Err(TimerError::Conflict { class });
        }

        let session = TimerSession::start(class, config, now);
        info!("Started {} {} session {}", class, session.mode, session.id);
        self.sessions.insert(class, session.clone());
        Ok(session)
    }

    pub fn pause(&mut self, class: TimerClass, now: DateTime<Utc>) -> Result<TimerSession> {
        let session = self.active_mut(class, "pause")?;
        session.pause(now)?;
        debug!("Paused {} session at {:.1}s", class, session.elapsed_at_last_checkpoint);
        Ok(session.clone())
    }

    pub fn resume(&mut self, class: TimerClass, now: DateTime<Utc>) -> Result<TimerSession> {
        let session = self.active_mut(class, "resume")?;
        session.resume(now)?;
        debug!("Resumed {} session, effective start {}", class, session.started_at);
        Ok(session.clone())
    }

    /// Stop the class's session and release its slot
    pub fn stop(&mut self, class: TimerClass, now: DateTime<Utc>) -> Result<FinishedSession> {
        let before = self.active_mut(class, "stop")?.clone();
        let mut session = before.clone();
        let elapsed_secs = session.stop(now)?;
        self.sessions.remove(&class);
        info!("Stopped {} session {} after {:.1}s", class, session.id, elapsed_secs);
        Ok(FinishedSession {
            session: before,
            elapsed_secs,
        })
    }

    /// Detect completion for a running session.
    ///
    /// A completed session is stopped and its slot released, so the same
    /// completion can never be reported twice.
    pub fn complete_if_due(&mut self, class: TimerClass, now: DateTime<Utc>) -> Option<FinishedSession> {
        let due = self.sessions.get(&class).is_some_and(|s| s.completion_due(now));
        if !due {
            return None;
        }

        let mut session = self.sessions.remove(&class)?;
        session.completion_fired = true;
        let elapsed_secs = session
            .total_duration
            .map(|total| session.elapsed_secs(now).min(total))
            .unwrap_or_else(|| session.elapsed_secs(now));
        info!("{} session {} completed after {:.1}s", class, session.id, elapsed_secs);
        Some(FinishedSession { session, elapsed_secs })
    }

    /// Advance derived interval indices; returns sessions whose index moved
    pub fn refresh_intervals(&mut self, now: DateTime<Utc>) -> Vec<TimerSession> {
        self.sessions
            .values_mut()
            .filter(|s| s.state == TimerState::Running)
            .filter_map(|s| s.refresh_interval(now).then(|| s.clone()))
            .collect()
    }

    /// Put a restored session in place, replacing whatever the class held
    pub fn install(&mut self, session: TimerSession) {
        debug!("Installing restored {} session {}", session.class, session.id);
        self.sessions.insert(session.class, session);
    }

    fn active_mut(&mut self, class: TimerClass, operation: &'static str) -> Result<&mut TimerSession> {
        self.sessions
            .get_mut(&class)
            .filter(|s| s.is_active())
            .ok_or(TimerError::InvalidTransition {
                class,
                operation,
                state: TimerState::Stopped,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TimerMode;
    use crate::utils::clock::{Clock, ManualClock};

    #[test]
    fn test_same_class_conflicts_other_class_succeeds() {
        let clock = ManualClock::at_epoch();
        let mut registry = SessionRegistry::new();

        registry.start(TimerClass::Primary, &SessionConfig::stopwatch(), clock.now()).unwrap();
        let err = registry
            .start(TimerClass::Primary, &SessionConfig::countdown(60.0), clock.now())
            .unwrap_err();
        assert!(matches!(err, TimerError::Conflict { class: TimerClass::Primary }));

        registry.start(TimerClass::Quick, &SessionConfig::stopwatch(), clock.now()).unwrap();
        assert_eq!(registry.active_classes(), vec![TimerClass::Primary, TimerClass::Quick]);
    }

    #[test]
    fn test_invalid_config_takes_no_slot() {
        let clock = ManualClock::at_epoch();
        let mut registry = SessionRegistry::new();

        let err = registry
            .start(TimerClass::Quick, &SessionConfig::countdown(0.0), clock.now())
            .unwrap_err();
        assert!(matches!(err, TimerError::InvalidConfig { mode: TimerMode::Countdown, .. }));
        assert!(registry.active_classes().is_empty());
    }

    #[test]
    fn test_paused_session_still_holds_the_slot() {
        let clock = ManualClock::at_epoch();
        let mut registry = SessionRegistry::new();
        registry.start(TimerClass::Primary, &SessionConfig::stopwatch(), clock.now()).unwrap();
        registry.pause(TimerClass::Primary, clock.now()).unwrap();

        assert!(registry
            .start(TimerClass::Primary, &SessionConfig::stopwatch(), clock.now())
            .is_err());
    }

    #[test]
    fn test_stop_releases_slot() {
        let clock = ManualClock::at_epoch();
        let mut registry = SessionRegistry::new();
        registry.start(TimerClass::Primary, &SessionConfig::stopwatch(), clock.now()).unwrap();
        clock.advance_secs(30.0);

        let finished = registry.stop(TimerClass::Primary, clock.now()).unwrap();
        assert_eq!(finished.elapsed_secs, 30.0);
        assert!(registry.get(TimerClass::Primary).is_none());
        assert!(registry.stop(TimerClass::Primary, clock.now()).is_err());

        registry.start(TimerClass::Primary, &SessionConfig::stopwatch(), clock.now()).unwrap();
    }

    #[test]
    fn test_completion_reported_exactly_once() {
        let clock = ManualClock::at_epoch();
        let mut registry = SessionRegistry::new();
        registry.start(TimerClass::Primary, &SessionConfig::countdown(60.0), clock.now()).unwrap();

        clock.advance_secs(30.0);
        assert!(registry.complete_if_due(TimerClass::Primary, clock.now()).is_none());

        clock.advance_secs(45.0);
        let finished = registry.complete_if_due(TimerClass::Primary, clock.now()).unwrap();
        assert_eq!(finished.elapsed_secs, 60.0);
        assert!(finished.session.completion_fired);

        assert!(registry.complete_if_due(TimerClass::Primary, clock.now()).is_none());
        assert!(!registry.is_active(TimerClass::Primary));
    }

    #[test]
    fn test_paused_countdown_does_not_complete() {
        let clock = ManualClock::at_epoch();
        let mut registry = SessionRegistry::new();
        registry.start(TimerClass::Primary, &SessionConfig::countdown(60.0), clock.now()).unwrap();
        clock.advance_secs(20.0);
        registry.pause(TimerClass::Primary, clock.now()).unwrap();
        clock.advance_secs(600.0);

        assert!(registry.complete_if_due(TimerClass::Primary, clock.now()).is_none());
    }

    #[test]
    fn test_refresh_intervals_reports_boundary_crossings() {
        let clock = ManualClock::at_epoch();
        let mut registry = SessionRegistry::new();
        registry
            .start(TimerClass::Primary, &SessionConfig::interval(300.0, 60.0), clock.now())
            .unwrap();

        clock.advance_secs(30.0);
        assert!(registry.refresh_intervals(clock.now()).is_empty());

        clock.advance_secs(95.0);
        let moved = registry.refresh_intervals(clock.now());
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].current_interval_index, Some(2));
    }
}
