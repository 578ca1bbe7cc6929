//! EPSS fetcher entry point.
//!
//! Loads configuration, wires up signal-driven cancellation, and hands off
//! to the orchestrator. Exit 0 on success and on clean signal shutdown,
//! exit 1 on any other orchestrator error.

use anyhow::{Context, Result};
use clap::Parser;
use epss_fetcher::config::Config;
use epss_fetcher::error::IngestError;
use epss_fetcher::orchestrator::Orchestrator;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "epss-fetcher")]
#[command(about = "Mirror the EPSS dataset into Elasticsearch or batched JSON files")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Delete the checkpoint file and start from the beginning
    #[arg(long)]
    reset: bool,

    /// Target date for an incremental update (YYYY-MM-DD)
    #[arg(long, default_value = "")]
    date: String,

    /// Fetch only new data since the last checkpointed date
    #[arg(long)]
    incremental: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = if config.logging.level.is_empty() {
                    "info"
                } else {
                    config.logging.level.as_str()
                };
                tracing_subscriber::EnvFilter::new(level)
            }),
        )
        .init();

    info!(
        strategy = %config.strategy,
        fetchers = config.workers.fetchers,
        processors = config.workers.processors,
        bulk_size = config.bulk.size,
        "configuration loaded"
    );

    if args.reset {
        info!("resetting checkpoint");
        if let Err(e) = std::fs::remove_file(&config.checkpoint.file_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(error = %e, "failed to remove checkpoint file");
            }
        }
    }

    let orchestrator = Orchestrator::new(config).context("failed to create orchestrator")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let target_date = if args.date.is_empty() {
        None
    } else {
        Some(args.date.as_str())
    };

    info!("starting EPSS fetcher");
    match orchestrator.run(cancel, target_date, args.incremental).await {
        Ok(()) => {
            info!("EPSS fetcher completed successfully");
            Ok(())
        }
        Err(IngestError::Cancelled) => {
            info!("EPSS fetcher stopped by signal");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "orchestrator error");
            std::process::exit(1);
        }
    }
}

/// SIGINT and SIGTERM both cancel the root token for a graceful drain.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down gracefully"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down gracefully"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt, shutting down gracefully");
        }
        cancel.cancel();
    });
}
