//! HTTP API module
//!
//! This module contains all HTTP endpoint handlers and response structures.

pub mod handlers;
pub mod responses;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;
use handlers::*;

/// Create the HTTP router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sessions/:class", get(session_handler))
        .route("/sessions/:class/start", post(start_handler))
        .route("/sessions/:class/pause", post(pause_handler))
        .route("/sessions/:class/resume", post(resume_handler))
        .route("/sessions/:class/stop", post(stop_handler))
        .route("/sessions/:class/sync", post(sync_handler))
        .route("/sessions/:class/completion", get(completion_handler))
        .route("/lifecycle/background", post(background_handler))
        .route("/lifecycle/foreground", post(foreground_handler))
        .route("/signals/:action", post(signal_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
