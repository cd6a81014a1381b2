//! Completion watch background task

use std::{sync::Arc, time::Duration};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::state::AppState;

/// Background task that detects finished countdowns and delivers due alerts
pub async fn completion_watch_task(state: Arc<AppState>, tick: Duration) {
    info!("Starting completion watch, ticking every {:?}", tick);

    let mut interval = interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let delivered = state.deliver_due_alerts();
        if delivered > 0 {
            debug!("Delivered {} alerts", delivered);
        }

        for finished in state.check_completions() {
            info!(
                "{} session completed after {:.1}s",
                finished.session.class, finished.elapsed_secs
            );
        }
    }
}
