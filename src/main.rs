use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clickguard::config::GuardConfig;
use clickguard::http::{AppState, HttpServer, OPERATIONS};
use clickguard::ratelimit::{IdentityExtractor, Janitor, LimiterRegistry, StoreProvider, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "clickguard", version)]
#[command(about = "Rate limited click board API")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    info!("Starting Clickguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GuardConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let provider = StoreProvider::from_config(&config.store)?;
    if let Err(e) = provider.prepare().await {
        // The table is created on first use once the database is reachable;
        // until then each operation's failure policy applies
        warn!(error = %e, "Window store not ready at startup");
    }

    let rules = config.rate_limiting.effective_rules()?;
    let extractor = IdentityExtractor::from_config(&config.identity)?;
    let registry = Arc::new(LimiterRegistry::build(&rules, OPERATIONS, &provider, &extractor));
    info!(operations = registry.len(), "Rate limiters initialized");

    let clock = Arc::new(SystemClock);
    let janitor = Janitor::for_registry(
        &registry,
        Duration::from_secs(config.rate_limiting.sweep_interval_secs),
    )
    .spawn(clock.clone());

    let server = HttpServer::new(config.server.http_addr, AppState::new(registry, clock));

    // Run the server with graceful shutdown on Ctrl+C
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    janitor.shutdown().await;
    served?;

    info!("Clickguard stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
