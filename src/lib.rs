//! Topic-multiplexing pub/sub client over a bounded pool of WebSocket connections
//!
//! Topics are spread over at most `max_connections` connections carrying
//! `topics_per_connection` topics each. Every connection keeps its socket
//! alive with PING/PONG, reconnects with exponential backoff, keeps the
//! server's subscriptions in sync with LISTEN/UNLISTEN and hands decoded push
//! payloads to per-topic handlers.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod constants;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod status;
pub mod topic;

pub use auth::{AuthProvider, AuthState, StaticAuth};
pub use backoff::ExponentialBackoff;
pub use client::{Connection, ConnectionPool, Frame, FrameSocket, Transport, WsTransport};
pub use config::{Config, PoolConfig};
pub use errors::{PoolError, Result};
pub use status::{ConnectionStatus, StatusSink, TracingStatusSink};
pub use topic::{HandlerError, HandlerResult, Topic, TopicHandler, TopicKey};
