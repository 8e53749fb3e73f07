pub mod metrics;
pub mod runner;
pub mod schedule;
pub mod window;

pub use metrics::JobMetrics;
pub use runner::{aggregation_jobs, AggregationJob, JobRunner};
pub use schedule::{is_cron_due, normalize_cron};
pub use window::{average_window, window_bounds, Snap};
