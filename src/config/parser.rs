//! Command-line argument parsing for pool configuration

use clap::Parser;
use std::time::Duration;

use super::defaults::Defaults;
use super::{AuthConfig, Config, OutputConfig, PoolConfig, TargetConfig};
use crate::errors::{PoolError, Result};

/// Raw configuration from command line arguments
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pubsub-pool",
    version,
    about = "Subscribe to push-notification topics over a bounded pool of WebSocket connections",
    long_about = None
)]
pub struct RawConfig {
    /// Push service endpoint
    #[arg(
        short = 't',
        long = "target",
        value_name = "URL",
        default_value = Defaults::ENDPOINT,
        help = "WebSocket endpoint of the push service (ws:// or wss://)"
    )]
    pub target: String,

    /// Upstream HTTP proxy
    #[arg(
        long = "proxy",
        value_name = "URL",
        help = "HTTP proxy to tunnel connections through (http://host:port)"
    )]
    pub proxy: Option<String>,

    /// Custom headers
    #[arg(
        short = 'H',
        long = "header",
        value_name = "HEADER",
        action = clap::ArgAction::Append,
        help = "Custom handshake headers in 'Key: Value' format (can be used multiple times)"
    )]
    pub headers: Vec<String>,

    /// Access token
    #[arg(
        long = "auth-token",
        value_name = "TOKEN",
        env = "PUBSUB_AUTH_TOKEN",
        hide_env_values = true,
        default_value = "",
        help = "Access token sent with every LISTEN/UNLISTEN"
    )]
    pub auth_token: String,

    /// User id
    #[arg(
        long = "user-id",
        value_name = "ID",
        env = "PUBSUB_USER_ID",
        default_value = "",
        help = "Id of the logged in user"
    )]
    pub user_id: String,

    /// Topics to subscribe to
    #[arg(
        short = 'T',
        long = "topic",
        value_name = "TOPIC",
        action = clap::ArgAction::Append,
        help = "Topic key to subscribe to, e.g. 'video-playback-by-id.1234' (can be used multiple times)"
    )]
    pub topics: Vec<String>,

    #[arg(
        long = "heartbeat-interval",
        value_name = "DURATION",
        default_value = Defaults::HEARTBEAT_INTERVAL,
        help = "Time between PING frames (e.g. '30s', '4m')"
    )]
    pub heartbeat_interval: String,

    #[arg(
        long = "heartbeat-timeout",
        value_name = "DURATION",
        default_value = Defaults::HEARTBEAT_TIMEOUT,
        help = "How long to wait for a PONG before reconnecting"
    )]
    pub heartbeat_timeout: String,

    #[arg(
        long = "topics-per-connection",
        value_name = "COUNT",
        default_value_t = Defaults::TOPICS_PER_CONNECTION,
        help = "Maximum topics carried by one connection"
    )]
    pub topics_per_connection: usize,

    #[arg(
        long = "max-connections",
        value_name = "COUNT",
        default_value_t = Defaults::MAX_CONNECTIONS,
        help = "Maximum number of simultaneous connections"
    )]
    pub max_connections: usize,

    #[arg(
        long = "backoff-min",
        value_name = "DURATION",
        default_value = Defaults::BACKOFF_MIN,
        help = "First reconnect delay"
    )]
    pub backoff_min: String,

    #[arg(
        long = "backoff-max",
        value_name = "DURATION",
        default_value = Defaults::BACKOFF_MAX,
        help = "Longest reconnect delay"
    )]
    pub backoff_max: String,

    #[arg(
        long = "recv-timeout",
        value_name = "DURATION",
        default_value = Defaults::RECV_TIMEOUT,
        help = "Receive poll window of the connection loop"
    )]
    pub recv_timeout: String,

    #[arg(
        long = "stop-timeout",
        value_name = "DURATION",
        default_value = Defaults::STOP_TIMEOUT,
        help = "How long a stopping connection may take to close"
    )]
    pub stop_timeout: String,

    #[arg(
        long = "connect-timeout",
        value_name = "DURATION",
        default_value = Defaults::CONNECT_TIMEOUT,
        help = "Timeout of a single connect attempt"
    )]
    pub connect_timeout: String,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose", help = "Enable verbose logging")]
    pub verbose: bool,

    /// Print a session report on exit
    #[arg(long = "report", help = "Print traffic and connection statistics on exit")]
    pub report: bool,
}

impl RawConfig {
    /// Parse from command line arguments
    pub fn parse_from_args() -> Result<Self> {
        Ok(Self::parse())
    }

    /// Parse duration string with time suffixes (ms/s/m/h)
    pub(crate) fn parse_duration(duration_str: &str) -> Result<Duration> {
        let duration_str = duration_str.trim();

        if duration_str.is_empty() {
            return Err(PoolError::config("Duration cannot be empty"));
        }

        let (number_part, unit_millis) = if let Some(number) = duration_str.strip_suffix("ms") {
            (number, 1)
        } else if let Some(number) = duration_str.strip_suffix(['s', 'S']) {
            (number, 1_000)
        } else if let Some(number) = duration_str.strip_suffix(['m', 'M']) {
            (number, 60_000)
        } else if let Some(number) = duration_str.strip_suffix(['h', 'H']) {
            (number, 3_600_000)
        } else {
            // No suffix, assume seconds
            (duration_str, 1_000)
        };

        let value = number_part.trim().parse::<u64>().map_err(|_| {
            PoolError::config(format!(
                "Invalid duration format: '{}' - expected a number with an optional ms/s/m/h suffix",
                duration_str
            ))
        })?;
        value
            .checked_mul(unit_millis)
            .map(Duration::from_millis)
            .ok_or_else(|| PoolError::config(format!("Duration '{}' is too large", duration_str)))
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = PoolError;

    fn try_from(raw: RawConfig) -> Result<Self> {
        let pool = PoolConfig {
            heartbeat_interval: RawConfig::parse_duration(&raw.heartbeat_interval)?,
            heartbeat_timeout: RawConfig::parse_duration(&raw.heartbeat_timeout)?,
            topics_per_connection: raw.topics_per_connection,
            max_connections: raw.max_connections,
            backoff_min: RawConfig::parse_duration(&raw.backoff_min)?,
            backoff_max: RawConfig::parse_duration(&raw.backoff_max)?,
            recv_timeout: RawConfig::parse_duration(&raw.recv_timeout)?,
            stop_timeout: RawConfig::parse_duration(&raw.stop_timeout)?,
            connect_timeout: RawConfig::parse_duration(&raw.connect_timeout)?,
        };

        Ok(Config {
            target: TargetConfig {
                url: raw.target,
                proxy: raw.proxy,
                headers: raw.headers,
            },
            auth: AuthConfig {
                token: raw.auth_token,
                user_id: raw.user_id,
            },
            pool,
            output: OutputConfig {
                verbose: raw.verbose,
                report: raw.report,
            },
            topics: raw.topics,
        })
    }
}
