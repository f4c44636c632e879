//! Configuration validation logic

use super::{Config, PoolConfig};
use crate::errors::{PoolError, Result};
use url::Url;

/// Validate the configuration
pub fn validate(config: &Config) -> Result<()> {
    validate_target(config)?;
    validate_proxy(config)?;
    validate_headers(config)?;
    validate_pool(&config.pool)?;
    validate_topics(config)?;
    Ok(())
}

/// Validate target configuration
fn validate_target(config: &Config) -> Result<()> {
    let url = Url::parse(&config.target.url).map_err(|e| {
        PoolError::config(format!("Invalid target URL '{}': {}", config.target.url, e))
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(()),
        scheme => Err(PoolError::config(format!(
            "Invalid URL scheme '{}'. Only 'ws' and 'wss' are supported",
            scheme
        ))),
    }
}

fn validate_proxy(config: &Config) -> Result<()> {
    let Some(proxy) = &config.target.proxy else {
        return Ok(());
    };
    let url = Url::parse(proxy)
        .map_err(|e| PoolError::config(format!("Invalid proxy URL '{}': {}", proxy, e)))?;

    if url.scheme() != "http" {
        return Err(PoolError::config(format!(
            "Invalid proxy scheme '{}'. Only 'http' proxies are supported",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(PoolError::config(format!("Proxy URL '{}' has no host", proxy)));
    }
    Ok(())
}

/// Validate custom headers format
fn validate_headers(config: &Config) -> Result<()> {
    for header in &config.target.headers {
        if !header.contains(':') {
            return Err(PoolError::config(format!(
                "Invalid header format '{}'. Use 'Key: Value' format",
                header
            )));
        }
    }
    Ok(())
}

/// Validate pool sizing and timing
pub fn validate_pool(pool: &PoolConfig) -> Result<()> {
    if pool.topics_per_connection == 0 {
        return Err(PoolError::config(
            "Topics per connection must be greater than 0",
        ));
    }

    if pool.max_connections == 0 {
        return Err(PoolError::config(
            "Maximum connections must be greater than 0",
        ));
    }

    let durations = [
        ("Heartbeat interval", pool.heartbeat_interval),
        ("Heartbeat timeout", pool.heartbeat_timeout),
        ("Receive timeout", pool.recv_timeout),
        ("Stop timeout", pool.stop_timeout),
        ("Connect timeout", pool.connect_timeout),
        ("Minimum backoff", pool.backoff_min),
    ];
    for (name, duration) in durations {
        if duration.is_zero() {
            return Err(PoolError::config(format!("{} must be greater than 0", name)));
        }
    }

    if pool.backoff_min > pool.backoff_max {
        return Err(PoolError::config(format!(
            "Minimum backoff ({:?}) cannot exceed maximum backoff ({:?})",
            pool.backoff_min, pool.backoff_max
        )));
    }

    Ok(())
}

/// Validate the initial topic list
fn validate_topics(config: &Config) -> Result<()> {
    if let Some(empty) = config.topics.iter().position(|t| t.trim().is_empty()) {
        return Err(PoolError::config(format!(
            "Topic #{} is empty",
            empty + 1
        )));
    }

    if config.topics.len() > config.pool.max_topics() {
        return Err(PoolError::config(format!(
            "{} topics requested but the pool holds at most {} ({} connections x {} topics)",
            config.topics.len(),
            config.pool.max_topics(),
            config.pool.max_connections,
            config.pool.topics_per_connection
        )));
    }

    Ok(())
}
