//! API response structures

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::TimerError,
    services::tracker::RestoreReport,
    state::{SessionView, TimerClass},
    tasks::wake_scheduler::PendingWake,
};

/// API response structure for session commands
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub class: TimerClass,
    pub session: Option<SessionView>,
    /// Final elapsed time, set when a session ends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
}

impl SessionResponse {
    pub fn new(class: TimerClass, message: String, session: Option<SessionView>) -> Self {
        let status = match &session {
            Some(view) => view.session.state.to_string(),
            None => "stopped".to_string(),
        };
        Self {
            status,
            message,
            timestamp: Utc::now(),
            class,
            session,
            elapsed_secs: None,
        }
    }

    pub fn stopped(class: TimerClass, message: String, elapsed_secs: f64) -> Self {
        Self {
            elapsed_secs: Some(elapsed_secs),
            ..Self::new(class, message, None)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundResponse {
    pub saved: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForegroundResponse {
    pub restored: Vec<RestoreReport>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalResponse {
    pub status: String,
    pub channel: String,
}

/// Status response with every active session and pending wake
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active_sessions: Vec<SessionView>,
    pub pending_wakes: Vec<PendingWake>,
    pub mirror_authenticated: bool,
    pub uptime: String,
    pub port: u16,
    pub host: String,
    pub last_action: Option<String>,
    pub last_action_time: Option<DateTime<Utc>>,
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl HealthResponse {
    /// Create a new health response
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub status: String,
    pub message: String,
}

/// A [`TimerError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub TimerError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            TimerError::Conflict { .. } => StatusCode::CONFLICT,
            TimerError::InvalidTransition { .. } | TimerError::InvalidConfig { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            TimerError::RestoreStale { .. } | TimerError::RelayValidation { .. } => StatusCode::GONE,
            TimerError::Persistence { .. }
            | TimerError::Json { .. }
            | TimerError::RemoteSync(_)
            | TimerError::Notification(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TimerError> for ApiError {
    fn from(err: TimerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            status: "error".to_string(),
            message: self.0.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
