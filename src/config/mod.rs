//! Configuration management for the pub/sub connection pool
//!
//! This module provides a layered approach to configuration:
//! - Core structures
//! - CLI argument parsing
//! - Configuration validation
//! - Default value management

pub mod defaults;
pub mod parser;
pub mod validation;

use crate::errors::{ErrorContext, PoolError, Result};
use std::time::Duration;
use url::Url;

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub url: String,
    pub proxy: Option<String>,
    pub headers: Vec<String>,
}

/// Credentials handed to the auth provider
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: String,
    pub user_id: String,
}

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub topics_per_connection: usize,
    pub max_connections: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub recv_timeout: Duration,
    pub stop_timeout: Duration,
    pub connect_timeout: Duration,
}

impl PoolConfig {
    /// Most topics the pool can carry at once
    pub fn max_topics(&self) -> usize {
        self.max_connections
            .saturating_mul(self.topics_per_connection)
    }

    /// Fewest connections able to carry `topics` topics
    pub fn required_connections(&self, topics: usize) -> usize {
        topics.div_ceil(self.topics_per_connection.max(1))
    }
}

/// Output configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub verbose: bool,
    pub report: bool,
}

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    pub target: TargetConfig,
    pub auth: AuthConfig,
    pub pool: PoolConfig,
    pub output: OutputConfig,
    pub topics: Vec<String>,
}

impl Config {
    /// Parse and validate configuration from command line arguments
    pub fn from_args() -> Result<Self> {
        let raw_config = parser::RawConfig::parse_from_args()?;
        let config = raw_config.try_into()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Parsed endpoint URL
    pub fn target_url(&self) -> Result<Url> {
        Url::parse(&self.target.url)
            .with_config_context(&format!("Invalid target URL '{}'", self.target.url))
    }

    /// Parsed proxy URL, if one is configured
    pub fn proxy_url(&self) -> Result<Option<Url>> {
        self.target
            .proxy
            .as_deref()
            .map(|proxy| {
                Url::parse(proxy).with_config_context(&format!("Invalid proxy URL '{}'", proxy))
            })
            .transpose()
    }

    /// Get custom headers as key-value pairs
    pub fn custom_headers(&self) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        for header in &self.target.headers {
            if let Some((key, value)) = header.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            } else {
                return Err(PoolError::config(format!(
                    "Invalid header format '{}'. Use 'Key: Value' format",
                    header
                )));
            }
        }
        Ok(headers)
    }

    /// Human readable configuration summary, one setting per line
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "   Endpoint:         {}\n   Topics:           {}\n   Capacity:         {} topics x {} connections\n   Heartbeat:        every {}s (timeout {}s)\n   Backoff:          {}s .. {}s\n",
            self.target.url,
            self.topics.len(),
            self.pool.topics_per_connection,
            self.pool.max_connections,
            self.pool.heartbeat_interval.as_secs(),
            self.pool.heartbeat_timeout.as_secs(),
            self.pool.backoff_min.as_secs(),
            self.pool.backoff_max.as_secs(),
        );
        if let Some(proxy) = &self.target.proxy {
            summary.push_str(&format!("   Proxy:            {}\n", proxy));
        }
        if !self.target.headers.is_empty() {
            summary.push_str(&format!(
                "   Custom Headers:   {}\n",
                self.target.headers.len()
            ));
        }
        summary
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("📡 Pub/Sub Pool Configuration:");
        print!("{}", self.summary());
        if self.auth.token.is_empty() {
            println!("   Auth:             ⚠️  no token, waiting for login");
        }
        println!();
    }
}
