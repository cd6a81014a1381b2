//! Background tasks module
//!
//! This module contains background tasks that run alongside the HTTP server.

pub mod completion_watch;
pub mod relay;
pub mod wake_scheduler;

// Re-export main functions
pub use completion_watch::completion_watch_task;
pub use relay::{relay_task, ActionRelay};
pub use wake_scheduler::{wake_task, WakeScheduler};
