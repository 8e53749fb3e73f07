//! WebSocket gateway: UI clients join a group endpoint and receive every
//! message broadcast to that group.
//!
//! The ingest and TCP workers publish through Redis pub/sub; a bridge task
//! subscribes to the group channels and feeds the in-process bus the
//! WebSocket handlers read from. Clients receive the `message` body of each
//! bus event, exactly as the upstream publishers shaped it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tracing::{info, warn};

use gridpulse_bus::{channel_for_group, BusEvent, LocalBus};

pub struct GatewayState {
    pub bus: Arc<LocalBus>,
    pub telemetry_group: String,
    pub tcp_group: String,
}

pub fn app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws/telemetry", get(ws_telemetry))
        .route("/ws/tcp", get(ws_tcp))
        .route("/health", get(health))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "subscribers": state.bus.subscriber_count(),
    }))
}

async fn ws_telemetry(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let group = state.telemetry_group.clone();
    ws.on_upgrade(move |socket| handle_ws(socket, state, group))
}

async fn ws_tcp(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let group = state.tcp_group.clone();
    ws.on_upgrade(move |socket| handle_ws(socket, state, group))
}

async fn handle_ws(socket: WebSocket, state: Arc<GatewayState>, group: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.bus.subscribe(&group);

    // Forward group broadcasts to this client.
    let send_task = tokio::spawn(async move {
        while let Ok(body) = rx.recv().await {
            if sender.send(Message::Text(body.into())).await.is_err() {
                break;
            }
        }
    });

    // Consume incoming frames (pings, close) but ignore content.
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            if matches!(frame, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

/// Subscribe to the Redis group channels and replay message bodies into the
/// local bus. Reconnects with a flat delay on any pub/sub error.
pub async fn run_redis_bridge(
    redis_url: String,
    groups: Vec<String>,
    bus: Arc<LocalBus>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        match bridge_once(&redis_url, &groups, &bus, &mut stop).await {
            Ok(()) => break,
            Err(e) => {
                warn!(error = %e, "redis bridge error; reconnecting");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    info!("redis bridge stopped");
}

async fn bridge_once(
    redis_url: &str,
    groups: &[String],
    bus: &LocalBus,
    stop: &mut watch::Receiver<bool>,
) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    for group in groups {
        pubsub.subscribe(channel_for_group(group)).await?;
    }
    info!(groups = groups.len(), "redis bridge subscribed");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return Ok(());
                }
            }
            message = stream.next() => {
                let Some(message) = message else {
                    return Err(redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "pubsub stream closed",
                    )));
                };
                let channel = message.get_channel_name().to_string();
                let Some(group) = channel.strip_prefix("ws:") else {
                    continue;
                };
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "bad pubsub payload");
                        continue;
                    }
                };
                forward_event(bus, group, &payload);
            }
        }
    }
}

/// Unwrap the bus event envelope and hand clients only the message body.
fn forward_event(bus: &LocalBus, group: &str, payload: &str) {
    match serde_json::from_str::<BusEvent>(payload) {
        Ok(event) => match serde_json::to_string(&event.message) {
            Ok(body) => bus.send_raw(group, body),
            Err(e) => warn!(error = %e, "unserializable bus message"),
        },
        Err(e) => warn!(group = %group, error = %e, "malformed bus event"),
    }
}
