//! results-ingest - Election results ingestion service
//!
//! Polls the published results feed, commits changed snapshots and keeps
//! the aggregate cache consistent with the committed version.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use results_common::config::{ServiceConfig, ENV_DATABASE_PATH, ENV_FEED_URL, ENV_POLL_INTERVAL_SECS};
use results_common::events::CycleState;
use results_ingest::db::ResultStore;
use results_ingest::models::{ViewFilters, ViewKind};
use results_ingest::services::SchedulerConfig;
use results_ingest::{build_cache_backend, ResultsService};

/// Command-line arguments for results-ingest
#[derive(Parser, Debug)]
#[command(name = "results-ingest")]
#[command(about = "Election results ingestion and cache service")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Results feed URL (CSV)
    #[arg(long, env = ENV_FEED_URL)]
    feed_url: Option<String>,

    /// SQLite database path
    #[arg(long, env = ENV_DATABASE_PATH)]
    database: Option<PathBuf>,

    /// Seconds between scheduled ingestion cycles
    #[arg(long, env = ENV_POLL_INTERVAL_SECS)]
    poll_interval_secs: Option<u64>,

    /// Run a single ingestion cycle, print the contest totals and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Starting results-ingest v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = resolve_config(&args)?;

    info!("Feed URL: {}", config.feed_url);
    info!("Database path: {}", config.database_path.display());

    let pool = results_common::db::init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let store = ResultStore::new(pool);

    let backend = build_cache_backend(&config.cache)
        .await
        .context("Failed to set up cache backend")?;

    let mut schedule = SchedulerConfig::from_config(&config);
    if args.once {
        schedule = schedule.manual_only();
    }

    let service = ResultsService::start(&config, store, backend, schedule)
        .context("Failed to start results service")?;

    if args.once {
        let result = run_once(&service).await;
        service.shutdown().await;
        return result;
    }

    info!(
        "Polling every {}s (Ctrl+C to stop)",
        config.poll_interval_secs
    );
    shutdown_signal().await;

    service.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// CLI > environment (via clap) > TOML file > defaults
fn resolve_config(args: &Args) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    config
        .apply_env_overrides()
        .context("Invalid environment override")?;

    if let Some(url) = &args.feed_url {
        config.feed_url = url.clone();
    }
    if let Some(path) = &args.database {
        config.database_path = path.clone();
    }
    if let Some(secs) = args.poll_interval_secs {
        config.poll_interval_secs = secs;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_once(service: &ResultsService) -> Result<()> {
    let cycle_id = service.trigger_ingestion().await?;
    let status = service
        .wait_for_cycle(cycle_id)
        .await?
        .context("Ingestion cycle vanished")?;

    if status.state == CycleState::Failed {
        error!(
            "Ingestion cycle failed: {}",
            status.error.as_deref().unwrap_or("unknown error")
        );
        anyhow::bail!("Ingestion cycle {} failed", cycle_id);
    }
    info!("Ingestion cycle {} ended: {}", cycle_id, status.state);

    let view = service
        .get_aggregate(ViewKind::ContestTotals, ViewFilters::all())
        .await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
