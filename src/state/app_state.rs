//! Main application state: the single owner of every timer session
//!
//! Every mutation, whether it comes from the API, the relay, restore or the
//! completion watch, goes through the registry lock held here. Side effects
//! (live surface, remote mirror, wakes, events) are issued while that lock is
//! held so they observe transitions in the order they happened.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    registry::{FinishedSession, SessionRegistry},
    session::{SessionConfig, TimerClass, TimerSession, TimerState},
};
use crate::{
    error::{Result, TimerError},
    persistence::{CompletionRecord, FileSnapshotStore, SideChannel, SnapshotStore},
    services::{
        live_surface::{FileSurface, LiveSurface, SurfaceContent},
        mirror::RemoteMirror,
        notifications::{NotificationScheduler, NotificationSink, NotificationSpool},
        tracker::{BackgroundTracker, RestoreReport},
    },
    tasks::wake_scheduler::WakeScheduler,
    utils::{clock::Clock, format::format_uptime, signals::SignalBus},
};

/// Events published to collaborators on every observable change
#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    StateChanged {
        class: TimerClass,
        state: TimerState,
        elapsed_secs: f64,
    },
    Completed {
        class: TimerClass,
        elapsed_secs: f64,
    },
    Conflict {
        class: TimerClass,
    },
}

/// A session together with its derived values at one instant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session: TimerSession,
    pub elapsed_secs: f64,
    pub remaining_secs: Option<f64>,
}

/// The stores and channels the application state drives
pub struct AppComponents {
    pub clock: Arc<dyn Clock>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub surface: Arc<dyn LiveSurface>,
    pub notifications: Arc<dyn NotificationSink>,
    pub side_channel: SideChannel,
    pub mirror: RemoteMirror,
}

impl AppComponents {
    /// File-backed components sharing one data directory with the companion
    pub fn open(dir: &Path, clock: Arc<dyn Clock>, mirror: RemoteMirror) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| TimerError::persistence(format!("create {}", dir.display()), e))?;

        Ok(Self {
            clock,
            snapshots: Arc::new(FileSnapshotStore::new(dir)),
            surface: Arc::new(FileSurface::new(dir)),
            notifications: Arc::new(NotificationSpool::open(dir)?),
            side_channel: SideChannel::open(dir),
            mirror,
        })
    }
}

/// Main application state that owns the session registry
pub struct AppState {
    registry: Mutex<SessionRegistry>,
    tracker: BackgroundTracker,
    side_channel: SideChannel,
    mirror: RemoteMirror,
    wake: WakeScheduler,
    signals: SignalBus,
    clock: Arc<dyn Clock>,
    /// Channel for timer events
    event_tx: broadcast::Sender<TimerEvent>,
    /// Server metadata
    pub start_time: Instant,
    pub port: u16,
    pub host: String,
    /// Last action tracking
    last_action: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl AppState {
    pub fn new(components: AppComponents, host: String, port: u16) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let notifications = NotificationScheduler::new(components.notifications);

        Self {
            registry: Mutex::new(SessionRegistry::new()),
            tracker: BackgroundTracker::new(components.snapshots, components.surface, notifications),
            side_channel: components.side_channel,
            mirror: components.mirror,
            wake: WakeScheduler::new(),
            signals: SignalBus::new(),
            clock: components.clock,
            event_tx,
            start_time: Instant::now(),
            port,
            host,
            last_action: Mutex::new(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────

    pub fn start_session(&self, class: TimerClass, config: &SessionConfig) -> Result<TimerSession> {
        let now = self.clock.now();
        let mut registry = self.registry();

        let session = match registry.start(class, config, now) {
            Ok(session) => session,
            Err(e) => {
                if matches!(e, TimerError::Conflict { .. }) {
                    warn!("Refusing to start {}: {}", class, e);
                    self.emit(TimerEvent::Conflict { class });
                }
                return Err(e);
            }
        };

        self.publish_surface(&session);
        self.mirror.record_start(&session, now);
        self.wake.schedule_refresh(now);
        self.wake.schedule_processing(now, session.total_duration);
        self.record_action(format!("start {}", class), now);
        self.emit_state(&session, now);
        Ok(session)
    }

    pub fn pause_session(&self, class: TimerClass) -> Result<TimerSession> {
        let now = self.clock.now();
        let mut registry = self.registry();

        let session = registry.pause(class, now)?;
        self.publish_surface(&session);
        self.mirror.record_pause(now);
        self.record_action(format!("pause {}", class), now);
        self.emit_state(&session, now);
        Ok(session)
    }

    pub fn resume_session(&self, class: TimerClass) -> Result<TimerSession> {
        let now = self.clock.now();
        let mut registry = self.registry();

        let session = registry.resume(class, now)?;
        self.publish_surface(&session);
        self.mirror.record_resume(&session, now);
        self.record_action(format!("resume {}", class), now);
        self.emit_state(&session, now);
        Ok(session)
    }

    pub fn stop_session(&self, class: TimerClass) -> Result<FinishedSession> {
        let now = self.clock.now();
        let mut registry = self.registry();

        let finished = registry.stop(class, now)?;
        self.end_externally(class);
        self.record_action(format!("stop {}", class), now);
        self.emit(TimerEvent::StateChanged {
            class,
            state: TimerState::Stopped,
            elapsed_secs: finished.elapsed_secs,
        });
        self.release_background_work(&registry);
        Ok(finished)
    }

    /// Touch the mirror and ask the push service to refresh the surface
    pub fn force_sync(&self, class: TimerClass) -> Result<TimerSession> {
        let now = self.clock.now();
        let registry = self.registry();

        let session = registry
            .get(class)
            .filter(|s| s.is_active())
            .cloned()
            .ok_or(TimerError::InvalidTransition {
                class,
                operation: "sync",
                state: TimerState::Stopped,
            })?;
        self.mirror.force_sync(&session, now);
        Ok(session)
    }

    /// Stop every running session that ran out of time and advance interval indices.
    ///
    /// A class with a live snapshot is left alone: restore reports its
    /// completion, and its ladder still owns the completion alert.
    pub fn check_completions(&self) -> Vec<FinishedSession> {
        let now = self.clock.now();
        let mut registry = self.registry();

        for session in registry.refresh_intervals(now) {
            debug!(
                "{} session entered interval {:?}",
                session.class, session.current_interval_index
            );
            self.emit_state(&session, now);
        }

        let finished: Vec<FinishedSession> = TimerClass::ALL
            .into_iter()
            .filter(|class| !self.tracker.has_snapshot(*class))
            .filter_map(|class| registry.complete_if_due(class, now))
            .collect();

        for done in &finished {
            let class = done.session.class;
            self.end_externally(class);
            self.emit(TimerEvent::Completed {
                class,
                elapsed_secs: done.elapsed_secs,
            });
        }
        if !finished.is_empty() {
            self.release_background_work(&registry);
        }
        finished
    }

    /// Hand due local alerts to the user
    pub fn deliver_due_alerts(&self) -> usize {
        self.tracker.notifications().deliver_due(self.clock.now())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Snapshot every running session before the host loses control
    pub fn on_enter_background(&self) -> usize {
        let now = self.clock.now();
        let registry = self.registry();

        let mut saved = Vec::new();
        for class in registry.active_classes() {
            let Some(session) = registry.get(class) else {
                continue;
            };
            match self.tracker.save(session, now) {
                Ok(Some(snapshot)) => saved.push(snapshot),
                Ok(None) => {}
                Err(e) => warn!("Failed to save {} snapshot, keeping it in memory only: {}", class, e),
            }
        }

        if !saved.is_empty() {
            let expected = saved
                .iter()
                .filter_map(|s| s.session.total_duration)
                .reduce(f64::min);
            self.wake.schedule_refresh(now);
            self.wake.schedule_processing(now, expected);
        }
        info!("Entered background with {} saved sessions", saved.len());
        saved.len()
    }

    /// Reconstruct every class that left a snapshot behind
    pub fn on_enter_foreground(&self) -> Vec<RestoreReport> {
        let now = self.clock.now();
        let mut registry = self.registry();

        let mut reports = Vec::new();
        for class in TimerClass::ALL {
            if self.resumed_since_snapshot(&registry, class) {
                info!("{} was resumed while in the background, discarding its snapshot", class);
                self.tracker.discard(class);
                continue;
            }

            match self.tracker.restore(class, now) {
                Ok(Some(report)) => {
                    registry.install(report.session.clone());
                    self.publish_surface(&report.session);
                    self.mirror.record_start(&report.session, now);
                    if report.completed {
                        self.emit(TimerEvent::Completed {
                            class,
                            elapsed_secs: report.elapsed_secs,
                        });
                    }
                    self.emit_state(&report.session, now);
                    reports.push(report);
                }
                Ok(None) => {}
                Err(e @ TimerError::RestoreStale { .. }) => info!("{}", e),
                Err(e) => warn!("Failed to restore {} session: {}", class, e),
            }
        }
        reports
    }

    fn resumed_since_snapshot(&self, registry: &SessionRegistry, class: TimerClass) -> bool {
        let Some(current) = registry.get(class).filter(|s| s.state == TimerState::Running) else {
            return false;
        };
        matches!(
            self.tracker.peek(class),
            Ok(Some(snapshot)) if current.last_transition_at > snapshot.exit_time
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn session(&self, class: TimerClass) -> Option<TimerSession> {
        self.registry().get(class).cloned()
    }

    pub fn session_state(&self, class: TimerClass) -> TimerState {
        self.registry()
            .get(class)
            .map(|s| s.state)
            .unwrap_or(TimerState::Stopped)
    }

    pub fn session_view(&self, class: TimerClass) -> Option<SessionView> {
        let now = self.clock.now();
        self.registry().get(class).map(|session| view_of(session, now))
    }

    pub fn active_classes(&self) -> Vec<TimerClass> {
        self.registry().active_classes()
    }

    pub fn active_sessions(&self) -> Vec<SessionView> {
        let now = self.clock.now();
        let registry = self.registry();
        registry
            .active_classes()
            .into_iter()
            .filter_map(|class| registry.get(class))
            .map(|session| view_of(session, now))
            .collect()
    }

    /// Consume the completion record left by a surface-initiated stop
    pub fn take_pending_completion(&self, class: TimerClass) -> Result<Option<CompletionRecord>> {
        self.side_channel.take_completion(class)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.event_tx.subscribe()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn tracker(&self) -> &BackgroundTracker {
        &self.tracker
    }

    pub fn surface(&self) -> &Arc<dyn LiveSurface> {
        self.tracker.surface()
    }

    pub fn side_channel(&self) -> &SideChannel {
        &self.side_channel
    }

    pub fn mirror(&self) -> &RemoteMirror {
        &self.mirror
    }

    pub fn wake(&self) -> &WakeScheduler {
        &self.wake
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    /// Calculate server uptime as a formatted string
    pub fn get_uptime(&self) -> String {
        format_uptime(self.start_time.elapsed().as_secs())
    }

    /// Get last action information
    pub fn get_last_action(&self) -> (Option<String>, Option<DateTime<Utc>>) {
        match self.last_action.lock().ok().and_then(|a| a.clone()) {
            Some((action, at)) => (Some(action), Some(at)),
            None => (None, None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Side effects
    // ─────────────────────────────────────────────────────────────────────

    fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_surface(&self, session: &TimerSession) {
        if let Err(e) = self.surface().publish(&SurfaceContent::from_session(session)) {
            warn!("Failed to update live surface for {}: {}", session.class, e);
        }
    }

    /// Snapshot, alerts, surface and mirror all forget the class
    fn end_externally(&self, class: TimerClass) {
        if let Err(e) = self.tracker.clear(class) {
            warn!("Failed to clear {} snapshot: {}", class, e);
        }
        self.tracker.notifications().cancel(class);
        if let Err(e) = self.surface().end(class) {
            warn!("Failed to end live surface for {}: {}", class, e);
        }
        self.mirror.record_end();
    }

    fn release_background_work(&self, registry: &SessionRegistry) {
        if registry.active_classes().is_empty() {
            self.wake.cancel_all();
        }
    }

    fn record_action(&self, action: String, at: DateTime<Utc>) {
        if let Ok(mut last_action) = self.last_action.lock() {
            *last_action = Some((action, at));
        }
    }

    fn emit_state(&self, session: &TimerSession, now: DateTime<Utc>) {
        self.emit(TimerEvent::StateChanged {
            class: session.class,
            state: session.state,
            elapsed_secs: session.elapsed_secs(now),
        });
    }

    fn emit(&self, event: TimerEvent) {
        // Nobody listening is not an error
        if self.event_tx.send(event).is_err() {
            debug!("No timer event subscribers");
        }
    }
}

fn view_of(session: &TimerSession, now: DateTime<Utc>) -> SessionView {
    SessionView {
        session: session.clone(),
        elapsed_secs: session.elapsed_secs(now),
        remaining_secs: session.remaining_secs(now),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::persistence::MemorySnapshotStore;
    use crate::services::live_surface::MemorySurface;
    use crate::services::mirror::{MemoryMirrorBackend, MirrorWorker};
    use crate::utils::clock::ManualClock;
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub state: Arc<AppState>,
        pub clock: Arc<ManualClock>,
        pub worker: MirrorWorker,
        pub mirror_backend: Arc<MemoryMirrorBackend>,
        pub snapshots: Arc<MemorySnapshotStore>,
        pub surface: Arc<MemorySurface>,
        pub spool: Arc<NotificationSpool>,
        pub dir: TempDir,
    }

    pub(crate) fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_epoch());
        let mirror_backend = Arc::new(MemoryMirrorBackend::new());
        let (mirror, worker) = RemoteMirror::new(Some("user-1".to_string()), mirror_backend.clone());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let surface = Arc::new(MemorySurface::new());
        let spool = Arc::new(NotificationSpool::new_in_memory());

        let components = AppComponents {
            clock: clock.clone(),
            snapshots: snapshots.clone(),
            surface: surface.clone(),
            notifications: spool.clone(),
            side_channel: SideChannel::open(dir.path()),
            mirror,
        };

        Harness {
            state: Arc::new(AppState::new(components, "127.0.0.1".to_string(), 0)),
            clock,
            worker,
            mirror_backend,
            snapshots,
            surface,
            spool,
            dir,
        }
    }
}
