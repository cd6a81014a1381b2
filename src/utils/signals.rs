//! Process signals and the in-process relay signal bus

use futures::stream::StreamExt;
use signal_hook_tokio::Signals;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::state::TimerAction;

/// A payload-less wake-up for the relay.
///
/// The signal only says "look at the side-channel"; the action itself is
/// always read from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSignal {
    /// Posted on the channel for one action kind
    Action(TimerAction),
    /// Generic hint (SIGUSR1)
    Hint,
}

impl ActionSignal {
    pub fn channel_name(&self) -> String {
        match self {
            ActionSignal::Action(action) => format!("timer.action.{}", action),
            ActionSignal::Hint => "timer.action".to_string(),
        }
    }
}

/// Fan-out of relay signals to every listener
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<ActionSignal>,
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    pub fn notify(&self, signal: ActionSignal) {
        debug!("Signal on {}", signal.channel_name());
        // No receiver just means the relay is not running yet; the poller covers it
        let _ = self.tx.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionSignal> {
        self.tx.subscribe()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
pub async fn shutdown_signal() {
    let mut signals = match Signals::new([signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT]) {
        Ok(signals) => signals,
        Err(e) => {
            warn!("Failed to install shutdown handler: {}", e);
            return std::future::pending().await;
        }
    };

    if let Some(signal) = signals.next().await {
        info!("Received signal: {}", signal);
    }
}

/// Forward SIGUSR1 to the bus as a relay hint
pub async fn relay_hint_listener(bus: SignalBus) {
    let mut signals = match Signals::new([signal_hook::consts::SIGUSR1]) {
        Ok(signals) => signals,
        Err(e) => {
            warn!("Failed to install SIGUSR1 handler, relying on polling: {}", e);
            return;
        }
    };

    info!("Listening for relay hints on SIGUSR1");
    while signals.next().await.is_some() {
        bus.notify(ActionSignal::Hint);
    }
}
