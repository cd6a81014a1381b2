//! Error types for timer operations

use std::fmt;

use crate::state::{TimerAction, TimerClass, TimerMode, TimerState};

/// Why the relay dropped a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRejection {
    /// Older than the validity window.
    Expired,
    /// Not newer than the last processed timestamp for the class.
    AlreadyProcessed,
    /// Stamped further ahead of the host clock than the validity window.
    FromFuture,
}

impl fmt::Display for RelayRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayRejection::Expired => write!(f, "action is outside the validity window"),
            RelayRejection::AlreadyProcessed => write!(f, "action was already processed"),
            RelayRejection::FromFuture => write!(f, "action is stamped ahead of the host clock"),
        }
    }
}

/// All errors that can occur while driving a timer session.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    // ─────────────────────────────────────────────────────────────────────
    // State machine
    // ─────────────────────────────────────────────────────────────────────
    #[error("A {class} session is already active")]
    Conflict { class: TimerClass },

    #[error("Cannot {operation} the {class} session while it is {state}")]
    InvalidTransition {
        class: TimerClass,
        operation: &'static str,
        state: TimerState,
    },

    #[error("Invalid {mode} session: {reason}")]
    InvalidConfig { mode: TimerMode, reason: &'static str },

    // ─────────────────────────────────────────────────────────────────────
    // Background restore and relay
    // ─────────────────────────────────────────────────────────────────────
    #[error("Snapshot for {class} discarded: {reason}")]
    RestoreStale { class: TimerClass, reason: String },

    #[error("Relay dropped {action} for {class}: {reason}")]
    RelayValidation {
        class: TimerClass,
        action: TimerAction,
        reason: RelayRejection,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Storage
    // ─────────────────────────────────────────────────────────────────────
    #[error("Persistence failed: {context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Best-effort channels
    // ─────────────────────────────────────────────────────────────────────
    #[error("Remote sync failed: {0}")]
    RemoteSync(String),

    #[error("Notification scheduling failed: {0}")]
    Notification(String),
}

impl TimerError {
    pub fn persistence(context: impl Into<String>, source: std::io::Error) -> Self {
        TimerError::Persistence {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        TimerError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using TimerError.
pub type Result<T> = std::result::Result<T, TimerError>;

impl From<TimerError> for String {
    fn from(err: TimerError) -> String {
        err.to_string()
    }
}
