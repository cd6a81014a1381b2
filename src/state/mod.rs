//! State management module
//!
//! This module contains the timer state machine, the per-class session
//! registry and the application state that owns them.

pub mod app_state;
pub mod registry;
pub mod session;

// Re-export main types
pub use app_state::{AppComponents, AppState, SessionView, TimerEvent};
pub use registry::{FinishedSession, SessionRegistry};
pub use session::{SessionConfig, TimerAction, TimerClass, TimerMode, TimerSession, TimerState};
