//! TCP service counters and the health endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use gridpulse_store::WriterMetrics;

#[derive(Debug, Default)]
pub struct TcpMetrics {
    pub connections_total: AtomicU64,
    pub active_connections: AtomicI64,
    pub timeouts_total: AtomicU64,
    pub parse_errors_total: AtomicU64,
}

#[derive(Clone)]
struct HealthState {
    tcp: Arc<TcpMetrics>,
    writer: Arc<WriterMetrics>,
}

/// Snapshot both the connection counters and the batch writer counters.
pub fn snapshot(tcp: &TcpMetrics, writer: &WriterMetrics) -> serde_json::Value {
    serde_json::json!({
        "connections_total": tcp.connections_total.load(Ordering::Relaxed),
        "active_connections": tcp.active_connections.load(Ordering::Relaxed),
        "timeouts_total": tcp.timeouts_total.load(Ordering::Relaxed),
        "parse_errors_total": tcp.parse_errors_total.load(Ordering::Relaxed),
        "messages_queued": writer.messages_queued.load(Ordering::Relaxed),
        "batches_flushed": writer.batches_flushed.load(Ordering::Relaxed),
        "mongo_errors_total": writer.mongo_errors_total.load(Ordering::Relaxed),
        "queue_size": writer.queue_size.load(Ordering::Relaxed),
    })
}

pub fn health_router(tcp: Arc<TcpMetrics>, writer: Arc<WriterMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { tcp, writer })
}

async fn health(State(state): State<HealthState>) -> Json<serde_json::Value> {
    Json(snapshot(&state.tcp, &state.writer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_merges_writer_counters() {
        let tcp = TcpMetrics::default();
        let writer = WriterMetrics::default();
        tcp.connections_total.store(5, Ordering::Relaxed);
        writer.batches_flushed.store(2, Ordering::Relaxed);
        let body = snapshot(&tcp, &writer);
        assert_eq!(body["connections_total"], 5);
        assert_eq!(body["batches_flushed"], 2);
        assert_eq!(body["parse_errors_total"], 0);
        assert!(body.get("queue_size").is_some());
    }
}
