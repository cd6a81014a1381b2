//! Utility functions module
//!
//! Clock access, formatting helpers and process signal handling.

pub mod clock;
pub mod format;
pub mod signals;

// Re-export main functions
pub use clock::{Clock, ManualClock, SystemClock};
pub use signals::{shutdown_signal, ActionSignal, SignalBus};
