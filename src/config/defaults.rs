//! Default values and configuration presets

use super::{AuthConfig, Config, OutputConfig, PoolConfig, TargetConfig};
use crate::constants::*;
use std::time::Duration;

/// Default configuration values
pub struct Defaults;

impl Defaults {
    pub const ENDPOINT: &'static str = DEFAULT_ENDPOINT;
    pub const HEARTBEAT_INTERVAL: &'static str = "4m";
    pub const HEARTBEAT_TIMEOUT: &'static str = "10s";
    pub const TOPICS_PER_CONNECTION: usize = TOPICS_PER_CONNECTION;
    pub const MAX_CONNECTIONS: usize = MAX_CONNECTIONS;
    pub const BACKOFF_MIN: &'static str = "1s";
    pub const BACKOFF_MAX: &'static str = "3m";
    pub const RECV_TIMEOUT: &'static str = "500ms";
    pub const STOP_TIMEOUT: &'static str = "2s";
    pub const CONNECT_TIMEOUT: &'static str = "10s";
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            topics_per_connection: TOPICS_PER_CONNECTION,
            max_connections: MAX_CONNECTIONS,
            backoff_min: BACKOFF_MIN,
            backoff_max: BACKOFF_MAX,
            recv_timeout: RECV_POLL_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Default timing with a custom size
    pub fn sized(topics_per_connection: usize, max_connections: usize) -> Self {
        Self {
            topics_per_connection,
            max_connections,
            ..Self::default()
        }
    }

    /// Aggressive heartbeat and backoff, for flaky networks
    pub fn responsive() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            backoff_max: Duration::from_secs(30),
            ..Self::default()
        }
    }
}

impl Config {
    /// Default configuration for an endpoint, without credentials or topics
    pub fn default_for(target_url: &str) -> Self {
        Self {
            target: TargetConfig {
                url: target_url.to_string(),
                proxy: None,
                headers: vec![],
            },
            auth: AuthConfig {
                token: String::new(),
                user_id: String::new(),
            },
            pool: PoolConfig::default(),
            output: OutputConfig {
                verbose: false,
                report: false,
            },
            topics: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_config() {
        let pool = PoolConfig::default();
        assert_eq!(pool.topics_per_connection, Defaults::TOPICS_PER_CONNECTION);
        assert_eq!(pool.max_connections, Defaults::MAX_CONNECTIONS);
        assert_eq!(pool.heartbeat_interval, Duration::from_secs(240));
        assert_eq!(pool.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(pool.max_topics(), 1000);
    }

    #[test]
    fn test_sized_keeps_timing() {
        let pool = PoolConfig::sized(2, 1);
        assert_eq!(pool.max_topics(), 2);
        assert_eq!(pool.recv_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_responsive_preset() {
        let pool = PoolConfig::responsive();
        assert!(pool.heartbeat_interval < PoolConfig::default().heartbeat_interval);
        assert_eq!(pool.topics_per_connection, TOPICS_PER_CONNECTION);
    }

    #[test]
    fn test_default_for_endpoint() {
        let config = Config::default_for(Defaults::ENDPOINT);
        assert_eq!(config.target.url, DEFAULT_ENDPOINT);
        assert!(config.topics.is_empty());
        assert!(!config.output.verbose);
    }
}
