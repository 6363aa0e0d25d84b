//! Portico: standalone server binary.
//!
//! This is the composition root. It initializes tracing, loads configuration
//! from a TOML file, wires the collaborators into the server builder, turns
//! SIGINT/SIGTERM into cancellation and runs the server until it stops.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portico::config::{DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use portico::{HttpServer, ServerConfig};

/// Portico: embeddable HTTP server bootstrap
#[derive(Parser, Debug)]
#[command(name = "portico", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "portico=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

fn init_tracing(filter: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::new(filter);
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration before tracing so the log format can be honoured
    let config = ServerConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    init_tracing(&log_filter, &config.logging.format);

    tracing::info!(
        config = %args.config,
        protocol = %config.server.protocol,
        environment = ?config.environment.env,
        "Loaded configuration"
    );

    let server = HttpServer::builder(config).build();

    let shutdown = CancellationToken::new();
    portico::cancel_on_signal(shutdown.clone());

    server.run(shutdown).await?;
    Ok(())
}
