use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{load_env_file, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::ratelimit::RateLimiter;
use tollgate::storage;

/// Per-identity rate limiting in front of an HTTP API.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML or TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Env file to load before reading the environment (default: `.env` if present)
    #[arg(long)]
    env_file: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    load_env_file(args.env_file.as_deref())?;
    let config = TollgateConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        backend = %config.storage.backend,
        default_limit = config.rate_limiting.default_limit,
        token_overrides = config.rate_limiting.token_limits.len(),
        block_duration_secs = config.rate_limiting.block_duration_secs,
        "Configuration loaded"
    );

    let storage = storage::connect(&config.storage).await?;
    let limiter = Arc::new(RateLimiter::new(&config.rate_limiting, storage));
    info!("Rate limiter initialized");

    let server = HttpServer::new(config.server.http_addr, limiter.clone())
        .trust_forwarded_for(config.server.trust_forwarded_for);

    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = limiter.close().await {
        warn!(error = %e, "Failed to close storage backend");
    }

    if let Err(e) = served {
        error!(error = %e, "Server stopped with an error");
        return Err(e.into());
    }

    info!("Tollgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
