//! Practice Timer - host daemon and live surface companion
//!
//! This is the main entry point for the practice-timer application.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use practice_timer::{
    api::create_router,
    companion,
    config::{Command, Config},
    services::{HttpMirrorBackend, MemoryMirrorBackend, MirrorBackend, RemoteMirror},
    state::{AppComponents, AppState},
    tasks::{completion_watch_task, relay_task, wake_task, ActionRelay},
    utils::{clock::SystemClock, shutdown_signal, signals::relay_hint_listener},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing with appropriate log level
    tracing_subscriber::fmt()
        .with_env_filter(format!("practice_timer={},tower_http=info", config.log_level()))
        .init();

    match config.command.clone() {
        Some(Command::Send {
            action,
            class,
            activity_id,
        }) => {
            let address = config.address().replace("0.0.0.0", "127.0.0.1");
            companion::send(&config.data_dir(), &address, action, class, activity_id).await?;
            Ok(())
        }
        Some(Command::Serve) | None => serve(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let data_dir = config.data_dir();
    info!("Starting practice-timer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration: host={}, port={}, data_dir={}, mirror={}",
        config.host,
        config.port,
        data_dir.display(),
        config.mirror_url.as_deref().unwrap_or("in-memory")
    );

    let backend: Arc<dyn MirrorBackend> = match &config.mirror_url {
        Some(url) => Arc::new(HttpMirrorBackend::new(url)?),
        None => Arc::new(MemoryMirrorBackend::new()),
    };
    let (mirror, mirror_worker) = RemoteMirror::new(config.user_id.clone(), backend);

    // Create application state
    let components = AppComponents::open(&data_dir, Arc::new(SystemClock), mirror)?;
    let state = Arc::new(AppState::new(components, config.host.clone(), config.port));

    // Anything left behind by a previous process comes back paused
    let restored = state.on_enter_foreground();
    if !restored.is_empty() {
        info!("Restored {} sessions from a previous run", restored.len());
    }

    // Start background tasks
    tokio::spawn(mirror_worker.run());
    tokio::spawn(completion_watch_task(Arc::clone(&state), config.completion_tick()));
    tokio::spawn(wake_task(Arc::clone(&state)));
    tokio::spawn(relay_hint_listener(state.signals().clone()));
    let relay = Arc::new(ActionRelay::new(Arc::clone(&state), config.action_window_secs));
    tokio::spawn(relay_task(relay, config.poll_interval()));

    // Create HTTP router with all endpoints
    let app = create_router(Arc::clone(&state));

    // Bind to the specified address
    let addr = config.address();
    let listener = TcpListener::bind(&addr).await?;

    info!("Server running on http://{}", addr);
    info!("Endpoints:");
    info!("  POST /sessions/:class/start|pause|resume|stop|sync");
    info!("  GET  /sessions/:class            - Current session");
    info!("  GET  /sessions/:class/completion - Consume a surface stop");
    info!("  POST /lifecycle/background|foreground");
    info!("  POST /signals/:action            - Relay wake-up");
    info!("  GET  /status                     - Sessions and pending wakes");
    info!("  GET  /health                     - Health check");

    // Setup graceful shutdown
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Leave snapshots behind so the next run can restore
    state.on_enter_background();
    info!("Server shutdown complete");
    Ok(())
}
