//! Rollup service counters and the health endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

#[derive(Debug, Default)]
pub struct JobMetrics {
    pub ticks_total: AtomicU64,
    pub jobs_run_total: AtomicU64,
    pub aggregates_written_total: AtomicU64,
    pub offline_transitions_total: AtomicU64,
    pub errors_total: AtomicU64,
    last_runs: Mutex<BTreeMap<String, String>>,
}

impl JobMetrics {
    pub fn record_run(&self, job: &str, at: chrono::DateTime<chrono::Utc>) {
        self.jobs_run_total.fetch_add(1, Ordering::Relaxed);
        self.last_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.to_string(), at.to_rfc3339());
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let last_runs = self
            .last_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        serde_json::json!({
            "ticks_total": self.ticks_total.load(Ordering::Relaxed),
            "jobs_run_total": self.jobs_run_total.load(Ordering::Relaxed),
            "aggregates_written_total": self.aggregates_written_total.load(Ordering::Relaxed),
            "offline_transitions_total": self.offline_transitions_total.load(Ordering::Relaxed),
            "errors_total": self.errors_total.load(Ordering::Relaxed),
            "last_runs": last_runs,
        })
    }
}

pub fn health_router(metrics: Arc<JobMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(metrics)
}

async fn health(State(metrics): State<Arc<JobMetrics>>) -> Json<serde_json::Value> {
    Json(metrics.snapshot())
}
