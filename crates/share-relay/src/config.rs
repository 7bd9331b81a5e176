use crate::server::DEFAULT_QUEUE_LIMIT;
use clap::Parser;
use share_core::chat::DEFAULT_MAX_CHAT_LEN;
use share_core::group::{DEFAULT_JOIN_WINDOW, MAX_JOIN_WINDOW};
use std::time::Duration;

/// Command-line arguments. Every option can also come from the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "share-relay")]
#[command(about = "Relay for peer discovery, groups, signaling and fallback file transfer")]
pub struct Args {
    /// Address to listen on for WebSocket connections
    #[arg(short, long, env = "SHARE_RELAY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Join window in minutes when a group creator does not pick one
    #[arg(long, env = "SHARE_RELAY_DEFAULT_JOIN_WINDOW", default_value_t = DEFAULT_JOIN_WINDOW.as_secs() / 60)]
    pub default_join_window: u64,

    /// Longest join window in minutes a group creator may ask for
    #[arg(long, env = "SHARE_RELAY_MAX_JOIN_WINDOW", default_value_t = MAX_JOIN_WINDOW.as_secs() / 60)]
    pub max_join_window: u64,

    /// Longest chat message in characters
    #[arg(long, env = "SHARE_RELAY_MAX_CHAT_LEN", default_value_t = DEFAULT_MAX_CHAT_LEN)]
    pub max_chat_len: usize,

    /// Relayed chunk bytes, in KiB, that may wait for one slow recipient
    /// before senders are told the relay is busy
    #[arg(long, env = "SHARE_RELAY_MAX_QUEUED_KIB", default_value_t = DEFAULT_QUEUE_LIMIT / 1024)]
    pub max_queued_kib: usize,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Relay settings, validated.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: String,
    pub default_join_window: Duration,
    pub max_join_window: Duration,
    pub max_chat_len: usize,
    pub max_queued_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            default_join_window: DEFAULT_JOIN_WINDOW,
            max_join_window: MAX_JOIN_WINDOW,
            max_chat_len: DEFAULT_MAX_CHAT_LEN,
            max_queued_bytes: DEFAULT_QUEUE_LIMIT,
        }
    }
}

impl RelayConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if args.default_join_window == 0 {
            return Err(ConfigError::ZeroJoinWindow);
        }
        if args.max_join_window < args.default_join_window {
            return Err(ConfigError::JoinWindowOrder {
                default: args.default_join_window,
                max: args.max_join_window,
            });
        }
        if args.max_chat_len == 0 {
            return Err(ConfigError::ZeroChatLength);
        }
        if args.max_queued_kib == 0 {
            return Err(ConfigError::ZeroQueueLimit);
        }

        Ok(Self {
            listen: args.listen.clone(),
            default_join_window: minutes(args.default_join_window),
            max_join_window: minutes(args.max_join_window),
            max_chat_len: args.max_chat_len,
            max_queued_bytes: args.max_queued_kib.saturating_mul(1024),
        })
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--default-join-window must be at least one minute")]
    ZeroJoinWindow,
    #[error("--max-join-window ({max}) is shorter than --default-join-window ({default})")]
    JoinWindowOrder { default: u64, max: u64 },
    #[error("--max-chat-len must be positive")]
    ZeroChatLength,
    #[error("--max-queued-kib must be positive")]
    ZeroQueueLimit,
}
