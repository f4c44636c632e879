//! Individual connection metrics collection

/// Counters for one connection slot
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    pub index: usize,
    pub connects: u64,
    pub connect_failures: u64,
    pub reconnects: u64,
    pub frames_received: u64,
    pub messages_dispatched: u64,
    pub malformed_messages: u64,
    pub handler_failures: u64,
    pub topics_listened: u64,
    pub topics_unlistened: u64,
}

impl ConnectionMetrics {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    /// Share of received frames that ended in a handler call (0.0 to 100.0)
    pub fn dispatch_rate(&self) -> f64 {
        if self.frames_received == 0 {
            return 100.0;
        }
        (self.messages_dispatched as f64 / self.frames_received as f64) * 100.0
    }

    /// Check if the connection did anything worth reporting
    pub fn has_activity(&self) -> bool {
        self.connects > 0 || self.connect_failures > 0 || self.frames_received > 0
    }
}
