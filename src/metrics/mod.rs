//! Metrics collection and reporting for the connection pool
//!
//! - Per-connection counters
//! - Pool-wide aggregate counters, readable without locking
//! - End-of-session report

pub mod aggregate;
pub mod connection;
pub mod reporting;

// Re-export public types for easier access
pub use aggregate::{MetricsSnapshot, PoolMetrics};
pub use connection::ConnectionMetrics;
