//! Metrics reporting and output formatting

use crate::metrics::aggregate::PoolMetrics;
use crate::metrics::connection::ConnectionMetrics;

use std::time::Duration;

impl PoolMetrics {
    /// Print the end-of-session report
    pub async fn print_report(&self, config_summary: &str, session_duration: Option<Duration>) {
        let connection_metrics = self.get_connection_metrics().await;
        let snapshot = self.snapshot();

        println!("\n📊 Pub/Sub Pool Session Report");
        println!("═══════════════════════════════════════════════════════════════");

        println!("\n🔧 Configuration:");
        print!("{}", config_summary);

        println!("📈 Traffic:");
        if let Some(duration) = session_duration {
            println!("   Session Duration:  {:.2}s", duration.as_secs_f64());
        }
        println!("   Frames Received:   {}", snapshot.frames_received);
        println!("   Messages Handled:  {}", snapshot.messages_dispatched);
        println!("   Malformed:         {}", snapshot.malformed_messages);
        println!("   Handler Failures:  {}", snapshot.handler_failures);
        if snapshot.unknown_messages > 0 {
            println!("   Unknown Kinds:     {}", snapshot.unknown_messages);
        }

        println!("\n📮 Subscriptions:");
        println!("   LISTEN Frames:     {}", snapshot.listens);
        println!("   UNLISTEN Frames:   {}", snapshot.unlistens);

        self.print_heartbeat_metrics(snapshot.pings, snapshot.pongs);
        self.print_connection_metrics(
            snapshot.connects,
            snapshot.connect_failures,
            snapshot.reconnects,
        );
        self.print_connection_breakdown(&connection_metrics);

        println!("═══════════════════════════════════════════════════════════════");
    }

    fn print_heartbeat_metrics(&self, pings: u64, pongs: u64) {
        println!("\n💓 Heartbeat:");
        println!("   PING Sent:         {}", pings);
        println!("   PONG Received:     {}", pongs);
    }

    fn print_connection_metrics(&self, connects: u64, failures: u64, reconnects: u64) {
        println!("\n🔌 Connection Metrics:");
        println!("   Sockets Opened:    {}", connects);
        if failures > 0 {
            println!("   Connect Failures:  {}", failures);
        }
        if reconnects > 0 {
            println!("   Reconnections:     {}", reconnects);
        }
    }

    fn print_connection_breakdown(&self, connection_metrics: &[ConnectionMetrics]) {
        let active: Vec<_> = connection_metrics
            .iter()
            .filter(|m| m.has_activity())
            .collect();
        if active.is_empty() {
            return;
        }

        println!("\n🧵 Per-Connection Breakdown:");
        for connection in active {
            println!(
                "   Connection {}: {} topics listened, {} frames, {} handled ({:.1}%), {} reconnects",
                connection.index,
                connection.topics_listened,
                connection.frames_received,
                connection.messages_dispatched,
                connection.dispatch_rate(),
                connection.reconnects
            );
        }
    }
}
