//! Ingest service counters and the health endpoint.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub connected: AtomicBool,
    /// Epoch-ms of the most recently processed message; 0 before the first.
    pub last_message_epoch_ms: AtomicI64,
    pub dropped: AtomicU64,
    pub fanout_errors: AtomicU64,
    pub queue_size: AtomicI64,
}

impl IngestMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "connected": self.connected.load(Ordering::Relaxed),
            "last_message": self.last_message_epoch_ms.load(Ordering::Relaxed),
            "dropped": self.dropped.load(Ordering::Relaxed),
            "fanout_errors": self.fanout_errors.load(Ordering::Relaxed),
            "queue_size": self.queue_size.load(Ordering::Relaxed),
        })
    }
}

pub fn health_router(metrics: Arc<IngestMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(metrics)
}

async fn health(State(metrics): State<Arc<IngestMetrics>>) -> Json<serde_json::Value> {
    Json(metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_field_names() {
        let metrics = IngestMetrics::default();
        metrics.connected.store(true, Ordering::Relaxed);
        metrics.dropped.store(3, Ordering::Relaxed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["connected"], true);
        assert_eq!(snapshot["dropped"], 3);
        assert_eq!(snapshot["fanout_errors"], 0);
        assert!(snapshot.get("queue_size").is_some());
        assert!(snapshot.get("last_message").is_some());
    }
}
