//! Companion side of the relay: what the live surface does when tapped
//!
//! The surface applies the action to its own clock right away, leaves the
//! action in the side-channel and then fires the payload-less signal. A
//! failed signal is not an error; the host's poller still finds the action.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    error::{Result, TimerError},
    persistence::{PendingAction, SideChannel},
    services::live_surface::{FileSurface, LiveSurface},
    state::{TimerAction, TimerClass},
};

/// Update the surface and leave the action for the host
pub fn post_action(
    dir: &Path,
    action: TimerAction,
    class: TimerClass,
    activity_id: Option<String>,
    now: DateTime<Utc>,
) -> Result<PendingAction> {
    let surface = FileSurface::new(dir);
    let content = surface.current(class)?;

    let activity_id = activity_id
        .or_else(|| content.as_ref().map(|c| c.activity_id.clone()))
        .unwrap_or_default();

    if let Some(mut content) = content {
        if content.apply_action(action, now) {
            surface.publish(&content)?;
        } else {
            surface.end(class)?;
        }
    }

    let pending = PendingAction::new(action, class, &activity_id, now);
    SideChannel::open(dir).post(&pending)?;
    info!("Posted {} for {} ({})", action, class, pending.correlation_id);
    Ok(pending)
}

/// Fire the signal for `action` at the host listening on `address`
pub async fn signal_host(address: &str, action: TimerAction) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| TimerError::RemoteSync(format!("Failed to build HTTP client: {}", e)))?;

    client
        .post(format!("http://{}/signals/{}", address, action))
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| TimerError::RemoteSync(format!("Signal for {} not delivered: {}", action, e)))?;
    Ok(())
}

/// Run the full companion flow: surface, side-channel, signal
pub async fn send(
    dir: &Path,
    address: &str,
    action: TimerAction,
    class: TimerClass,
    activity_id: Option<String>,
) -> Result<PendingAction> {
    let pending = post_action(dir, action, class, activity_id, Utc::now())?;

    if let Err(e) = signal_host(address, action).await {
        warn!("{}; the host will pick the action up on its next poll", e);
    }
    Ok(pending)
}
