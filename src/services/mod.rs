//! Services the timer drives on every transition
//!
//! This module contains the live surface adapter, the local notification
//! ladder, the remote mirror and the background tracker that ties snapshots
//! to restore.

pub mod live_surface;
pub mod mirror;
pub mod notifications;
pub mod tracker;

// Re-export main types
pub use live_surface::{FileSurface, LiveSurface, MemorySurface, SurfaceContent};
pub use mirror::{HttpMirrorBackend, MemoryMirrorBackend, MirrorBackend, MirrorWorker, RemoteMirror};
pub use notifications::{NotificationScheduler, NotificationSink, NotificationSpool, ScheduledAlert};
pub use tracker::{BackgroundTracker, RestoreReport};
