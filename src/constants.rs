//! Application-wide constants and protocol values

use std::time::Duration;

// Wire protocol
pub const DEFAULT_ENDPOINT: &str = "wss://pubsub-edge.twitch.tv/v1";
pub const NONCE_LENGTH: usize = 30;

// Heartbeat
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4 * 60);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

// Pool sizing
pub const TOPICS_PER_CONNECTION: usize = 50;
pub const MAX_CONNECTIONS: usize = 20;

// Reconnect backoff
pub const BACKOFF_MIN: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(3 * 60);
pub const BACKOFF_FACTOR: f64 = 2.0;
pub const BACKOFF_JITTER: f64 = 0.1;

// Loop and shutdown timing
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(500);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Proxy handshake
pub const MAX_PROXY_RESPONSE_BYTES: usize = 8 * 1024;

// Batches larger than this get a debug line with their size
pub const LARGE_BATCH_LOG_THRESHOLD: usize = 20;
