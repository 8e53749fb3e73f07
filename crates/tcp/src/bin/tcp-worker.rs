//! tcp-worker — heartbeat server for solar gateways.
//!
//! Decoded readouts flow through the batched writer into the solar tier
//! collections and out to the `tcp_telemetry` WebSocket group.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use gridpulse_bus::RedisBus;
use gridpulse_core::config::{load_dotenv, Config};
use gridpulse_liveness::LivenessIndex;
use gridpulse_store::{SolarBatchWriter, TelemetryStore};
use gridpulse_tcp::metrics::health_router;
use gridpulse_tcp::{SolarPipeline, TcpMetrics, TcpTelemetryServer};

// ── CLI ─────────────────────────────────────────────────────────────

/// TCP solar gateway server.
#[derive(Parser, Debug)]
#[command(name = "tcp-worker", version, about)]
struct Cli {
    /// Health endpoint port (0 disables it).
    #[arg(long, env = "TCP_HEALTH_PORT", default_value_t = 7001)]
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
    store.ensure_solar_collections(&config.retention).await;
    let bus = Arc::new(RedisBus::connect(&config.redis.url).await?);
    let liveness = match LivenessIndex::connect(&config.redis.url, config.liveness.device_track_secs)
        .await
    {
        Ok(index) => Some(index),
        Err(e) => {
            warn!(error = %e, "liveness index unavailable; solar devices untracked");
            None
        }
    };

    let (writer, writer_task) = SolarBatchWriter::spawn(
        store,
        config.tcp.queue_size,
        config.tcp.batch_size,
        config.tcp.batch_flush_ms,
    );
    let metrics = Arc::new(TcpMetrics::default());

    if cli.health_port > 0 {
        let app = health_router(metrics.clone(), writer.metrics());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.health_port)).await?;
        info!(port = cli.health_port, "tcp health server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "health server error");
            }
        });
    }

    let pipeline = Arc::new(SolarPipeline::new(
        writer.clone(),
        bus,
        liveness,
        config.groups.tcp.clone(),
    ));
    let server = TcpTelemetryServer::new(config.tcp.clone(), pipeline, metrics);

    let (stop_tx, stop_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(stop_rx));

    info!("tcp-worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let _ = stop_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_task).await;
    // Dropping the last writer handle lets the batch worker flush and exit.
    drop(writer);
    let _ = tokio::time::timeout(Duration::from_secs(5), writer_task).await;
    info!("tcp-worker exited cleanly");

    Ok(())
}
