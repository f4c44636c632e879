//! Client side of the pool
//!
//! - Transport abstraction over framed sockets
//! - WebSocket transport implementation
//! - Single connection lifecycle (heartbeat, subscription sync, dispatch)
//! - Connection pool distributing topics over connections

pub mod connection;
pub mod manager;
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

// Re-export public types for easier access
pub use connection::{Connection, ConnectionContext};
pub use manager::ConnectionPool;
pub use websocket::WsTransport;

use crate::errors::Result;

use async_trait::async_trait;

/// Application-level frame exchanged with the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Close frame, with the peer's code and reason when it sent one
    Close(Option<String>),
}

/// An established, framed socket
#[async_trait]
pub trait FrameSocket: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next inbound frame; `Ok(None)` once the stream has ended
    async fn recv(&mut self) -> Result<Option<Frame>>;

    /// Send a close frame and flush
    async fn close(&mut self) -> Result<()>;
}

/// Opens sockets to the push service
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FrameSocket>>;
}
