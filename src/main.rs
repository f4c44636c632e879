use pubsub_pool::config::Config;
use pubsub_pool::errors::Result;
use pubsub_pool::topic::HandlerError;
use pubsub_pool::{ConnectionPool, StaticAuth, Topic, TracingStatusSink, WsTransport};

use serde_json::Value;
use std::process;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() {
    // Initialize the application and run
    if let Err(e) = run().await {
        error!("Application failed: {}", e);
        process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<()> {
    // Parse and validate configuration
    let config = Config::from_args()?;

    // Initialize logging based on verbosity
    init_logging(&config);

    info!("📡 Pub/Sub Pool - topic-multiplexing WebSocket client");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.print_summary();

    let auth = if config.auth.token.is_empty() {
        warn!("No access token configured, connections wait for a login");
        StaticAuth::logged_out()
    } else {
        StaticAuth::new(config.auth.token.clone(), config.auth.user_id.clone())
    };
    let transport = WsTransport::from_config(&config)?;
    let pool = ConnectionPool::new(
        config.pool.clone(),
        Arc::new(transport),
        Arc::new(auth),
        Arc::new(TracingStatusSink),
    );

    let topics = config
        .topics
        .iter()
        .map(|key| Topic::new(key.as_str(), log_payload));
    pool.add_topics(topics).await?;

    let session_start = Instant::now();
    let interrupted = tokio::select! {
        _ = pool.start() => {
            info!("All {} connection(s) established", pool.connection_count().await);
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if !interrupted && let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl+c: {}", e);
    }
    warn!("Received Ctrl+C, initiating graceful shutdown...");
    pool.stop(true).await;

    if config.output.report {
        pool.metrics()
            .print_report(&config.summary(), Some(session_start.elapsed()))
            .await;
    }
    info!("Pool stopped");
    Ok(())
}

/// Handler used for topics given on the command line
async fn log_payload(payload: Value) -> std::result::Result<(), HandlerError> {
    info!("📨 {}", payload);
    Ok(())
}

/// Initialize logging based on configuration
fn init_logging(config: &Config) {
    let pool_level = if config.output.verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(
                    format!("pubsub_pool={}", pool_level)
                        .parse()
                        .expect("Invalid filter directive"),
                )
                .add_directive(
                    "tokio_tungstenite=warn"
                        .parse()
                        .expect("Invalid filter directive"),
                )
                .add_directive(
                    "tungstenite=warn"
                        .parse()
                        .expect("Invalid filter directive"),
                ),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");

    if config.output.verbose {
        info!("Verbose logging enabled");
    }
}
