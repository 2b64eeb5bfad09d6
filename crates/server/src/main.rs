//! Stowage engine daemon: runs background jobs and the scheduler.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::sync::Arc;
use std::time::Instant;
use stowage_core::config::AppConfig;
use stowage_server::{EngineContext, EngineJobHandler, JobQueue, JobWorker, Scheduler};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stowage - storage, caching and upload engine for a package registry
#[derive(Parser, Debug)]
#[command(name = "stowaged")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "STOWAGE_CONFIG",
        default_value = "config/stowage.toml"
    )]
    config: String,

    /// Identity used for lock ownership and logs
    #[arg(long, env = "STOWAGE_WORKER_ID", default_value = "stowaged")]
    worker_id: String,

    /// Drain the job queue once and exit
    #[arg(long)]
    once: bool,
}

fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    figment
        .merge(Env::prefixed("STOWAGE_").split("__"))
        .extract()
        .context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Stowage v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    stowage_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let ctx = EngineContext::from_config(config, args.worker_id.as_str())
        .await
        .context("failed to initialize engine")?;

    ctx.storage
        .health_check_all()
        .await
        .context("storage health check failed")?;
    ctx.metadata
        .health_check()
        .await
        .context("metadata health check failed")?;
    tracing::info!("Storage and metadata connectivity verified");

    let queue = JobQueue::new(ctx.metadata.clone(), ctx.config.jobs.clone());
    let worker = JobWorker::new(queue.clone(), Arc::new(EngineJobHandler::new(ctx.clone())));
    let mut scheduler = Scheduler::new(queue.clone(), ctx.config.scheduler.clone());

    if args.once {
        if ctx.config.scheduler.enabled {
            let enqueued = scheduler.run_due(Instant::now()).await?;
            tracing::info!(jobs = enqueued.len(), "Scheduler pass finished");
        }
        let mut total = 0usize;
        loop {
            let reports = worker.run_once().await?;
            if reports.is_empty() {
                break;
            }
            total += reports.len();
        }
        tracing::info!(jobs = total, "Job queue drained");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = tokio::task::JoinSet::new();

    if ctx.config.jobs.enabled {
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { worker.run(rx).await });
    } else {
        tracing::warn!("Job worker disabled by configuration");
    }
    if ctx.config.scheduler.enabled {
        let rx = shutdown_rx.clone();
        tasks.spawn(scheduler.run(rx));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, finishing running jobs");
    let _ = shutdown_tx.send(true);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Background task failed");
        }
    }
    tracing::info!("Stowage stopped");
    Ok(())
}
