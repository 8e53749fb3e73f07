//! Periodic job runner: aggregation cascades and the device liveness scan.
//!
//! One tick loop drives everything sequentially, so two jobs never write the
//! same target tier concurrently. The idempotency guard on
//! `(timestamp, device_id, topic)` additionally makes accidental overlap
//! safe.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use gridpulse_bus::{BusEvent, GroupBus, DEVICE_STATUS};
use gridpulse_core::config::LivenessConfig;
use gridpulse_core::topics;
use gridpulse_liveness::{staleness_thresholds, LivenessIndex};
use gridpulse_store::{StoreError, TelemetryStore};

use crate::metrics::JobMetrics;
use crate::schedule::{is_cron_due, normalize_cron};
use crate::window::{average_window, window_bounds, Snap};

/// One downsampling pass between two retention tiers.
#[derive(Debug, Clone)]
pub struct AggregationJob {
    pub name: &'static str,
    pub source: &'static str,
    pub target: &'static str,
    pub window: Duration,
    pub cron: &'static str,
    pub snap: Snap,
    pub default_topic: &'static str,
}

/// The full cascade: realtime grid, environment mirror, and energy counters.
pub fn aggregation_jobs() -> Vec<AggregationJob> {
    vec![
        AggregationJob {
            name: "rt_1m",
            source: "grid_rt_data",
            target: "today_grid_rt_data",
            window: Duration::minutes(1),
            cron: "* * * * *",
            snap: Snap::Minute,
            default_topic: topics::RT_DATA,
        },
        AggregationJob {
            name: "rt_10m",
            source: "today_grid_rt_data",
            target: "last_7_days_grid_rt_data",
            window: Duration::minutes(10),
            cron: "*/10 * * * *",
            snap: Snap::Minute,
            default_topic: topics::RT_DATA,
        },
        AggregationJob {
            name: "rt_30m",
            source: "last_7_days_grid_rt_data",
            target: "last_30_days_grid_rt_data",
            window: Duration::minutes(30),
            cron: "*/30 * * * *",
            snap: Snap::Minute,
            default_topic: topics::RT_DATA,
        },
        AggregationJob {
            name: "rt_3h",
            source: "last_30_days_grid_rt_data",
            target: "last_6_months_grid_rt_data",
            window: Duration::hours(3),
            cron: "0 */3 * * *",
            snap: Snap::Hour,
            default_topic: topics::RT_DATA,
        },
        AggregationJob {
            name: "rt_6h",
            source: "last_6_months_grid_rt_data",
            target: "this_year_grid_rt_data",
            window: Duration::hours(6),
            cron: "0 */6 * * *",
            snap: Snap::Hour,
            default_topic: topics::RT_DATA,
        },
        AggregationJob {
            name: "env_1m",
            source: "environment_data",
            target: "today_environment_data",
            window: Duration::minutes(1),
            cron: "* * * * *",
            snap: Snap::Minute,
            default_topic: topics::ENV_01,
        },
        AggregationJob {
            name: "env_10m",
            source: "today_environment_data",
            target: "last_7_days_environment_data",
            window: Duration::minutes(10),
            cron: "*/10 * * * *",
            snap: Snap::Minute,
            default_topic: topics::ENV_01,
        },
        AggregationJob {
            name: "env_30m",
            source: "last_7_days_environment_data",
            target: "last_30_days_environment_data",
            window: Duration::minutes(30),
            cron: "*/30 * * * *",
            snap: Snap::Minute,
            default_topic: topics::ENV_01,
        },
        AggregationJob {
            name: "env_3h",
            source: "last_30_days_environment_data",
            target: "last_6_months_environment_data",
            window: Duration::hours(3),
            cron: "0 */3 * * *",
            snap: Snap::Hour,
            default_topic: topics::ENV_01,
        },
        AggregationJob {
            name: "env_6h",
            source: "last_6_months_environment_data",
            target: "this_year_environment_data",
            window: Duration::hours(6),
            cron: "0 */6 * * *",
            snap: Snap::Hour,
            default_topic: topics::ENV_01,
        },
        AggregationJob {
            name: "eny_now_30m",
            source: "today_grid_eny_now_data",
            target: "last_30_days_grid_eny_now_data",
            window: Duration::minutes(30),
            cron: "*/30 * * * *",
            snap: Snap::Minute,
            default_topic: topics::ENY_NOW,
        },
        AggregationJob {
            name: "eny_now_3h",
            source: "last_30_days_grid_eny_now_data",
            target: "last_6_months_grid_eny_now_data",
            window: Duration::hours(3),
            cron: "0 */3 * * *",
            snap: Snap::Hour,
            default_topic: topics::ENY_NOW,
        },
        AggregationJob {
            name: "eny_now_6h",
            source: "last_6_months_grid_eny_now_data",
            target: "this_year_grid_eny_now_data",
            window: Duration::hours(6),
            cron: "0 */6 * * *",
            snap: Snap::Hour,
            default_topic: topics::ENY_NOW,
        },
    ]
}

const LIVENESS_SCAN_CRON: &str = "* * * * *";

pub struct JobRunner {
    store: TelemetryStore,
    liveness: LivenessIndex,
    bus: Arc<dyn GroupBus>,
    liveness_config: LivenessConfig,
    telemetry_group: String,
    metrics: Arc<JobMetrics>,
    tick: StdDuration,
    jobs: Vec<(AggregationJob, Schedule)>,
    liveness_schedule: Schedule,
    last_runs: HashMap<&'static str, DateTime<Utc>>,
    liveness_last_run: Option<DateTime<Utc>>,
}

impl JobRunner {
    pub fn new(
        store: TelemetryStore,
        liveness: LivenessIndex,
        bus: Arc<dyn GroupBus>,
        liveness_config: LivenessConfig,
        telemetry_group: String,
        metrics: Arc<JobMetrics>,
        tick_secs: u64,
    ) -> Self {
        let jobs = aggregation_jobs()
            .into_iter()
            .map(|job| {
                let schedule = Schedule::from_str(&normalize_cron(job.cron))
                    .unwrap_or_else(|e| panic!("bad cron for {}: {e}", job.name));
                (job, schedule)
            })
            .collect();
        let liveness_schedule = Schedule::from_str(&normalize_cron(LIVENESS_SCAN_CRON))
            .expect("liveness scan cron");
        Self {
            store,
            liveness,
            bus,
            liveness_config,
            telemetry_group,
            metrics,
            tick: StdDuration::from_secs(tick_secs.max(1)),
            jobs,
            liveness_schedule,
            last_runs: HashMap::new(),
            liveness_last_run: None,
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(jobs = self.jobs.len(), "job runner started");
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
            self.metrics.ticks_total.fetch_add(1, Ordering::Relaxed);
            let now = Utc::now();

            let due: Vec<AggregationJob> = self
                .jobs
                .iter()
                .filter(|(job, schedule)| {
                    is_cron_due(schedule, now, self.last_runs.get(job.name).copied())
                })
                .map(|(job, _)| job.clone())
                .collect();
            for job in due {
                self.last_runs.insert(job.name, now);
                match self.run_aggregation(&job, now).await {
                    Ok(written) => {
                        self.metrics.record_run(job.name, now);
                        self.metrics
                            .aggregates_written_total
                            .fetch_add(written, Ordering::Relaxed);
                        if written > 0 {
                            info!(job = job.name, written, "aggregation complete");
                        }
                    }
                    Err(e) => {
                        self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                        warn!(job = job.name, error = %e, "aggregation failed");
                    }
                }
            }

            if is_cron_due(&self.liveness_schedule, now, self.liveness_last_run) {
                self.liveness_last_run = Some(now);
                self.run_liveness_scan(now).await;
                self.metrics.record_run("liveness_scan", now);
            }
        }
        info!("job runner stopped");
    }

    /// One window pass: read, group-average, and insert whatever the
    /// idempotency guard lets through. Returns the number of documents
    /// written.
    pub async fn run_aggregation(
        &self,
        job: &AggregationJob,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let (window_start, window_end) = window_bounds(now, job.snap, job.window);
        let docs = self.store.read_window(job.source, window_start, window_end).await?;
        if docs.is_empty() {
            return Ok(0);
        }
        let aggregates = average_window(&docs, job.default_topic, window_end);

        let mut written = 0u64;
        for aggregate in aggregates {
            let exists = self
                .store
                .aggregate_exists(
                    job.target,
                    window_end,
                    aggregate.device_id.as_deref(),
                    &aggregate.topic,
                )
                .await?;
            if exists {
                continue;
            }
            self.store.insert_aggregate(job.target, &aggregate).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Scan every tracked topic and broadcast one `device.status` event per
    /// fresh offline transition.
    pub async fn run_liveness_scan(&self, now: DateTime<Utc>) {
        for (topic, stale_secs) in staleness_thresholds(&self.liveness_config) {
            let transitions = match self
                .liveness
                .scan_topic(topic, stale_secs, now.timestamp())
                .await
            {
                Ok(transitions) => transitions,
                Err(e) => {
                    self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %topic, error = %e, "liveness scan failed");
                    continue;
                }
            };
            for transition in transitions {
                self.metrics
                    .offline_transitions_total
                    .fetch_add(1, Ordering::Relaxed);
                info!(
                    topic = %transition.topic,
                    device_id = %transition.device_id,
                    "device went offline"
                );
                self.bus
                    .publish(
                        &self.telemetry_group,
                        BusEvent::new(
                            DEVICE_STATUS,
                            json!({
                                "device_id": transition.device_id,
                                "status": "offline",
                                "last_seen": transition.last_seen,
                                "topic": transition.topic,
                            }),
                        ),
                    )
                    .await;
            }
        }
    }
}
