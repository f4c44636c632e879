//! Per-connection status reporting

use std::fmt;
use tracing::{debug, info};

/// Lifecycle state of one connection, as shown to the outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Initializing,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Initializing => "initializing",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}

/// Receiver of connection status changes (a UI, a dashboard, a log)
pub trait StatusSink: Send + Sync {
    /// `status` and `topics` are each `None` when unchanged
    fn update(&self, index: usize, status: Option<ConnectionStatus>, topics: Option<usize>);

    /// The connection slot is gone for good
    fn remove(&self, index: usize);
}

/// Sink that writes every change to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn update(&self, index: usize, status: Option<ConnectionStatus>, topics: Option<usize>) {
        if let Some(status) = status {
            info!("Connection {} status: {}", index, status);
        }
        if let Some(topics) = topics {
            debug!("Connection {} carries {} topic(s)", index, topics);
        }
    }

    fn remove(&self, index: usize) {
        info!("Connection {} removed", index);
    }
}
