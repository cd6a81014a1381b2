//! Practice Timer - keeps a practice session timer consistent while the host
//! process is suspended
//!
//! This library provides the timer state machine, background snapshots and
//! restore, the local notification ladder, the relay that carries actions from
//! the live surface back to the host, and the remote mirror with its periodic
//! wake scheduler.

pub mod api;
pub mod companion;
pub mod config;
pub mod error;
pub mod persistence;
pub mod services;
pub mod state;
pub mod tasks;
pub mod utils;

// Re-export commonly used types
pub use api::create_router;
pub use config::Config;
pub use error::{Result, TimerError};
pub use state::AppState;
pub use utils::signals::shutdown_signal;
