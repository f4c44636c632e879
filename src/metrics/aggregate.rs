//! Aggregate metrics collection across all connections

use crate::metrics::connection::ConnectionMetrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Thread-safe aggregate metrics for the whole pool
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub total_connects: AtomicU64,
    pub total_connect_failures: AtomicU64,
    pub total_reconnects: AtomicU64,
    pub total_pings: AtomicU64,
    pub total_pongs: AtomicU64,
    pub total_listens: AtomicU64,
    pub total_unlistens: AtomicU64,
    pub total_frames_received: AtomicU64,
    pub total_messages_dispatched: AtomicU64,
    pub total_malformed_messages: AtomicU64,
    pub total_handler_failures: AtomicU64,
    pub total_unknown_messages: AtomicU64,
    connection_metrics: Arc<RwLock<HashMap<usize, ConnectionMetrics>>>,
}

/// Point-in-time copy of the aggregate counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connects: u64,
    pub connect_failures: u64,
    pub reconnects: u64,
    pub pings: u64,
    pub pongs: u64,
    pub listens: u64,
    pub unlistens: u64,
    pub frames_received: u64,
    pub messages_dispatched: u64,
    pub malformed_messages: u64,
    pub handler_failures: u64,
    pub unknown_messages: u64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_connection(&self, index: usize, update: impl FnOnce(&mut ConnectionMetrics)) {
        let mut metrics = self.connection_metrics.write().await;
        update(
            metrics
                .entry(index)
                .or_insert_with(|| ConnectionMetrics::new(index)),
        );
    }

    /// Record an established socket
    pub async fn record_connected(&self, index: usize) {
        self.total_connects.fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.connects += 1).await;
    }

    /// Record a failed connect attempt
    pub async fn record_connect_failure(&self, index: usize) {
        self.total_connect_failures.fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.connect_failures += 1).await;
    }

    /// Record a session torn down by a fault or a server directive
    pub async fn record_reconnect(&self, index: usize) {
        self.total_reconnects.fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.reconnects += 1).await;
    }

    pub fn record_ping(&self) {
        self.total_pings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.total_pongs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one LISTEN frame covering `topics` keys
    pub async fn record_listen(&self, index: usize, topics: usize) {
        self.total_listens.fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.topics_listened += topics as u64)
            .await;
    }

    /// Record one UNLISTEN frame covering `topics` keys
    pub async fn record_unlisten(&self, index: usize, topics: usize) {
        self.total_unlistens.fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.topics_unlistened += topics as u64)
            .await;
    }

    pub async fn record_frame_received(&self, index: usize) {
        self.total_frames_received.fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.frames_received += 1).await;
    }

    pub async fn record_dispatch(&self, index: usize) {
        self.total_messages_dispatched
            .fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.messages_dispatched += 1)
            .await;
    }

    pub async fn record_malformed(&self, index: usize) {
        self.total_malformed_messages
            .fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.malformed_messages += 1)
            .await;
    }

    pub async fn record_handler_failure(&self, index: usize) {
        self.total_handler_failures.fetch_add(1, Ordering::Relaxed);
        self.with_connection(index, |m| m.handler_failures += 1).await;
    }

    pub fn record_unknown(&self) {
        self.total_unknown_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Get read-only copies of the per-connection metrics, ordered by index
    pub async fn get_connection_metrics(&self) -> Vec<ConnectionMetrics> {
        let metrics = self.connection_metrics.read().await;
        let mut all: Vec<ConnectionMetrics> = metrics.values().cloned().collect();
        all.sort_by_key(|m| m.index);
        all
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connects: self.total_connects.load(Ordering::Relaxed),
            connect_failures: self.total_connect_failures.load(Ordering::Relaxed),
            reconnects: self.total_reconnects.load(Ordering::Relaxed),
            pings: self.total_pings.load(Ordering::Relaxed),
            pongs: self.total_pongs.load(Ordering::Relaxed),
            listens: self.total_listens.load(Ordering::Relaxed),
            unlistens: self.total_unlistens.load(Ordering::Relaxed),
            frames_received: self.total_frames_received.load(Ordering::Relaxed),
            messages_dispatched: self.total_messages_dispatched.load(Ordering::Relaxed),
            malformed_messages: self.total_malformed_messages.load(Ordering::Relaxed),
            handler_failures: self.total_handler_failures.load(Ordering::Relaxed),
            unknown_messages: self.total_unknown_messages.load(Ordering::Relaxed),
        }
    }
}
