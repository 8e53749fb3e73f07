//! gateway — WebSocket fan-out for UI clients.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use gridpulse_bus::LocalBus;
use gridpulse_core::config::{load_dotenv, Config};
use gridpulse_gateway::{app, run_redis_bridge, GatewayState};

/// Realtime WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "gateway", version, about)]
struct Cli {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _cli = Cli::parse();
    load_dotenv();
    let config = Config::from_env();
    config.log_summary();

    let bus = Arc::new(LocalBus::new());
    let state = Arc::new(GatewayState {
        bus: bus.clone(),
        telemetry_group: config.groups.telemetry.clone(),
        tcp_group: config.groups.tcp.clone(),
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let bridge = tokio::spawn(run_redis_bridge(
        config.redis.url.clone(),
        vec![config.groups.telemetry.clone(), config.groups.tcp.clone()],
        bus,
        stop_rx,
    ));

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = stop_tx.send(true);
    bridge.abort();
    info!("gateway exited cleanly");

    Ok(())
}
