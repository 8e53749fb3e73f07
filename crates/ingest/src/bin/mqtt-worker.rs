//! mqtt-worker — subscribes to the broker and runs the ingest pipeline.
//!
//! Exposes `GET /health` with the ingest counters on its own port.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rumqttc::AsyncClient;
use tokio::sync::watch;
use tracing::{info, warn};

use gridpulse_bus::RedisBus;
use gridpulse_core::config::{load_dotenv, Config};
use gridpulse_ingest::client::mqtt_options;
use gridpulse_ingest::metrics::health_router;
use gridpulse_ingest::subscriber::run_event_loop;
use gridpulse_ingest::{IngestMetrics, IngestQueue, IngestWorker};
use gridpulse_liveness::LivenessIndex;
use gridpulse_store::TelemetryStore;

// ── CLI ─────────────────────────────────────────────────────────────

/// MQTT telemetry ingest worker.
#[derive(Parser, Debug)]
#[command(name = "mqtt-worker", version, about)]
struct Cli {
    /// Health endpoint port (0 disables it).
    #[arg(long, env = "MQTT_HEALTH_PORT", default_value_t = 7002)]
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
    let liveness = Arc::new(
        LivenessIndex::connect(&config.redis.url, config.liveness.device_track_secs).await?,
    );

    let metrics = Arc::new(IngestMetrics::default());
    let (queue, queue_rx) = IngestQueue::bounded(
        config.ingest.queue_capacity,
        config.ingest.drop_on_full,
        metrics.clone(),
    );

    let options = mqtt_options(&config.mqtt)?;
    let (client, eventloop) = AsyncClient::new(options, 10);

    let (stop_tx, stop_rx) = watch::channel(false);

    let subscriber = tokio::spawn(run_event_loop(
        client.clone(),
        eventloop,
        config.mqtt.clone(),
        queue,
        metrics.clone(),
        stop_rx.clone(),
    ));

    let worker = IngestWorker::new(
        &config.ingest,
        config.validation.clone(),
        config.groups.telemetry.clone(),
        Arc::new(store),
        bus,
        liveness,
        metrics.clone(),
    );
    let worker_task = tokio::spawn(worker.run(queue_rx, stop_rx));

    if cli.health_port > 0 {
        let app = health_router(metrics.clone());
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", cli.health_port)).await?;
        info!(port = cli.health_port, "mqtt health server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "health server error");
            }
        });
    }

    info!("mqtt-worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let _ = stop_tx.send(true);
    let _ = client.disconnect().await;
    let grace = Duration::from_secs(config.ingest.shutdown_grace_secs + 5);
    let _ = tokio::time::timeout(grace, worker_task).await;
    subscriber.abort();
    info!("mqtt-worker exited cleanly");

    Ok(())
}
