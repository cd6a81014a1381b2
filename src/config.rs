//! Configuration and CLI argument handling

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::state::{TimerAction, TimerClass};

/// CLI argument parsing structure
#[derive(Parser, Debug, Clone)]
#[command(name = "practice-timer")]
#[command(about = "Keeps a practice session timer consistent across suspension, a live surface and a remote mirror")]
#[command(version)]
pub struct Config {
    /// Port to bind the server to
    #[arg(short, long, default_value = "20554", global = true)]
    pub port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Directory shared with the live surface companion
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the remote mirror; without it the mirror stays in memory
    #[arg(long)]
    pub mirror_url: Option<String>,

    /// Authenticated user id; mirror writes are skipped without one
    #[arg(long)]
    pub user_id: Option<String>,

    /// Relayed actions older than this many seconds are rejected
    #[arg(long, default_value = "10")]
    pub action_window_secs: f64,

    /// Side-channel polling interval in milliseconds
    #[arg(long, default_value = "500")]
    pub poll_interval_ms: u64,

    /// Completion watch tick in milliseconds
    #[arg(long, default_value = "1000")]
    pub completion_tick_ms: u64,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the timer host (default)
    Serve,
    /// Act as the live surface: relay a control action to the host
    Send {
        /// pause, resume or stop
        #[arg(value_parser = parse_action)]
        action: TimerAction,

        /// Timer class the action targets (primary or quick)
        #[arg(long, default_value = "primary", value_parser = parse_class)]
        class: TimerClass,

        /// Activity shown on the surface; defaults to the one on file
        #[arg(long)]
        activity_id: Option<String>,
    },
}

fn parse_action(value: &str) -> Result<TimerAction, String> {
    TimerAction::from_name(value).ok_or_else(|| format!("unknown action '{}'", value))
}

fn parse_class(value: &str) -> Result<TimerClass, String> {
    TimerClass::from_name(value).ok_or_else(|| format!("unknown timer class '{}'", value))
}

impl Config {
    /// Parse configuration from command line arguments
    pub fn parse() -> Self {
        Parser::parse()
    }

    /// Get the server address as a formatted string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the appropriate log level based on verbose flag
    pub fn log_level(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }

    /// The configured data directory, or the platform data dir
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("practice-timer")
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn completion_tick(&self) -> Duration {
        Duration::from_millis(self.completion_tick_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["practice-timer"]).unwrap();
        assert_eq!(config.address(), "127.0.0.1:20554");
        assert_eq!(config.action_window_secs, 10.0);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.log_level(), "info");
        assert!(config.command.is_none());
    }

    #[test]
    fn test_send_subcommand_accepts_main_alias() {
        let config = Config::try_parse_from([
            "practice-timer",
            "send",
            "pause",
            "--class",
            "main",
            "--port",
            "9000",
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        match config.command {
            Some(Command::Send { action, class, activity_id }) => {
                assert_eq!(action, TimerAction::Pause);
                assert_eq!(class, TimerClass::Primary);
                assert_eq!(activity_id, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        assert!(Config::try_parse_from(["practice-timer", "send", "rewind"]).is_err());
    }
}
