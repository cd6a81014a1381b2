//! HTTP endpoint handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use tracing::{error, info};

use super::responses::{
    ApiError, BackgroundResponse, ForegroundResponse, HealthResponse, SessionResponse, SignalResponse,
    StatusResponse,
};
use crate::{
    persistence::CompletionRecord,
    state::{AppState, SessionConfig, SessionView, TimerAction, TimerClass},
    utils::signals::ActionSignal,
};

/// Handle POST /sessions/:class/start
pub async fn start_handler(
    State(state): State<Arc<AppState>>,
    Path(class): Path<TimerClass>,
    Json(config): Json<SessionConfig>,
) -> Result<Json<SessionResponse>, ApiError> {
    state.start_session(class, &config)?;
    info!("Start endpoint called - {} {} session started", class, config.mode);
    Ok(Json(SessionResponse::new(
        class,
        format!("{} session started", config.mode),
        state.session_view(class),
    )))
}

/// Handle POST /sessions/:class/pause
pub async fn pause_handler(
    State(state): State<Arc<AppState>>,
    Path(class): Path<TimerClass>,
) -> Result<Json<SessionResponse>, ApiError> {
    state.pause_session(class)?;
    Ok(Json(SessionResponse::new(
        class,
        "Session paused".to_string(),
        state.session_view(class),
    )))
}

/// Handle POST /sessions/:class/resume
pub async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Path(class): Path<TimerClass>,
) -> Result<Json<SessionResponse>, ApiError> {
    state.resume_session(class)?;
    Ok(Json(SessionResponse::new(
        class,
        "Session resumed".to_string(),
        state.session_view(class),
    )))
}

/// Handle POST /sessions/:class/stop
pub async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(class): Path<TimerClass>,
) -> Result<Json<SessionResponse>, ApiError> {
    let finished = state.stop_session(class)?;
    Ok(Json(SessionResponse::stopped(
        class,
        "Session stopped".to_string(),
        finished.elapsed_secs,
    )))
}

/// Handle POST /sessions/:class/sync - Force the remote mirror and surface to refresh
pub async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Path(class): Path<TimerClass>,
) -> Result<Json<SessionResponse>, ApiError> {
    state.force_sync(class)?;
    Ok(Json(SessionResponse::new(
        class,
        "Sync requested".to_string(),
        state.session_view(class),
    )))
}

/// Handle GET /sessions/:class
pub async fn session_handler(
    State(state): State<Arc<AppState>>,
    Path(class): Path<TimerClass>,
) -> Result<Json<SessionView>, StatusCode> {
    state.session_view(class).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// Handle GET /sessions/:class/completion - Consume a surface-initiated completion
pub async fn completion_handler(
    State(state): State<Arc<AppState>>,
    Path(class): Path<TimerClass>,
) -> Result<Json<CompletionRecord>, StatusCode> {
    match state.take_pending_completion(class) {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to read completion record for {}: {}", class, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Handle POST /lifecycle/background
pub async fn background_handler(State(state): State<Arc<AppState>>) -> Json<BackgroundResponse> {
    let saved = state.on_enter_background();
    Json(BackgroundResponse {
        saved,
        timestamp: Utc::now(),
    })
}

/// Handle POST /lifecycle/foreground
pub async fn foreground_handler(State(state): State<Arc<AppState>>) -> Json<ForegroundResponse> {
    let restored = state.on_enter_foreground();
    Json(ForegroundResponse {
        restored,
        timestamp: Utc::now(),
    })
}

/// Handle POST /signals/:action - Payload-less wake-up for the relay
pub async fn signal_handler(
    State(state): State<Arc<AppState>>,
    Path(action): Path<TimerAction>,
) -> (StatusCode, Json<SignalResponse>) {
    let signal = ActionSignal::Action(action);
    state.signals().notify(signal);
    (
        StatusCode::ACCEPTED,
        Json(SignalResponse {
            status: "accepted".to_string(),
            channel: signal.channel_name(),
        }),
    )
}

/// Handle GET /status - Get current sessions and background work
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (last_action, last_action_time) = state.get_last_action();

    Json(StatusResponse {
        active_sessions: state.active_sessions(),
        pending_wakes: state.wake().pending(),
        mirror_authenticated: state.mirror().is_authenticated(),
        uptime: state.get_uptime(),
        port: state.port,
        host: state.host.clone(),
        last_action,
        last_action_time,
    })
}

/// Handle GET /health - Health check endpoint
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}
