//! jobs-worker — runs the aggregation cascades and the liveness scan.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use gridpulse_bus::RedisBus;
use gridpulse_core::config::{load_dotenv, Config};
use gridpulse_jobs::metrics::health_router;
use gridpulse_jobs::{JobMetrics, JobRunner};
use gridpulse_liveness::LivenessIndex;
use gridpulse_store::TelemetryStore;

// ── CLI ─────────────────────────────────────────────────────────────

/// Telemetry rollup and liveness scan worker.
#[derive(Parser, Debug)]
#[command(name = "jobs-worker", version, about)]
struct Cli {
    /// Health endpoint port (0 disables it).
    #[arg(long, env = "JOBS_HEALTH_PORT", default_value_t = 7003)]
    health_port: u16,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    load_dotenv();
    let config = Config::from_env();
    config.log_summary();

    let store = TelemetryStore::connect(&config.mongo).await?;
    store.ensure_indexes(&config.retention).await?;
    let bus = Arc::new(RedisBus::connect(&config.redis.url).await?);
    let liveness =
        LivenessIndex::connect(&config.redis.url, config.liveness.device_track_secs).await?;

    let metrics = Arc::new(JobMetrics::default());
    if cli.health_port > 0 {
        let app = health_router(metrics.clone());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.health_port)).await?;
        info!(port = cli.health_port, "jobs health server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "health server error");
            }
        });
    }

    let runner = JobRunner::new(
        store,
        liveness,
        bus,
        config.liveness.clone(),
        config.groups.telemetry.clone(),
        metrics,
        config.jobs.tick_secs,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner_task = tokio::spawn(runner.run(stop_rx));

    info!("jobs-worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = stop_tx.send(true);
    let _ = runner_task.await;
    info!("jobs-worker exited cleanly");

    Ok(())
}
