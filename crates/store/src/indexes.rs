//! Collection index and TTL management.
//!
//! Every tier collection carries a `timestamp` index for range queries; the
//! downsampled tiers add a TTL so documents expire with their retention
//! period. Existing indexes with a diverging key or TTL are dropped and
//! recreated. Index failures are logged and never abort startup.

use std::time::Duration;

use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{IndexOptions, TimeseriesGranularity, TimeseriesOptions};
use mongodb::{Collection, IndexModel};
use tracing::{info, warn};

use gridpulse_core::config::RetentionConfig;

use crate::error::StoreError;
use crate::store::TelemetryStore;

/// Base collections indexed for timestamp range queries only.
const BASE_COLLECTIONS: [&str; 9] = [
    "grid_rt_data",
    "grid_eny_now_data",
    "grid_day_data",
    "grid_eny_frz_data",
    "environment_data",
    "generator_data",
    "solar_data",
    "today_solar_data",
    "current_month_solar_data",
];

const TODAY_COLLECTIONS: [&str; 3] = [
    "today_grid_rt_data",
    "today_grid_eny_now_data",
    "today_environment_data",
];

const LAST_7_DAYS_COLLECTIONS: [&str; 2] = [
    "last_7_days_grid_rt_data",
    "last_7_days_environment_data",
];

const LAST_30_DAYS_COLLECTIONS: [&str; 3] = [
    "last_30_days_grid_rt_data",
    "last_30_days_environment_data",
    "last_30_days_grid_eny_now_data",
];

const LAST_6_MONTHS_COLLECTIONS: [&str; 3] = [
    "last_6_months_grid_rt_data",
    "last_6_months_environment_data",
    "last_6_months_grid_eny_now_data",
];

const THIS_YEAR_COLLECTIONS: [&str; 3] = [
    "this_year_grid_rt_data",
    "this_year_environment_data",
    "this_year_grid_eny_now_data",
];

impl TelemetryStore {
    /// Ensure search and TTL indexes across every telemetry collection.
    pub async fn ensure_indexes(&self, retention: &RetentionConfig) -> Result<(), StoreError> {
        for name in BASE_COLLECTIONS {
            self.ensure_timestamp_search(name).await;
        }

        let tiers: [(&[&str], u64); 5] = [
            (&TODAY_COLLECTIONS, retention.today_ttl_secs),
            (&LAST_7_DAYS_COLLECTIONS, retention.last_7_days_ttl_secs),
            (&LAST_30_DAYS_COLLECTIONS, retention.last_30_days_ttl_secs),
            (&LAST_6_MONTHS_COLLECTIONS, retention.last_6_months_ttl_secs),
            (&THIS_YEAR_COLLECTIONS, retention.this_year_ttl_secs),
        ];
        for (collections, ttl_secs) in tiers {
            for name in collections {
                self.ensure_timestamp_ttl(name, ttl_secs).await;
            }
        }

        let events = self.database().collection::<Document>("telemetry_events");
        ensure_index(&events, doc! {"timestamp": 1}, "timestamp_search", None).await;
        ensure_index(
            &events,
            doc! {"timestamp": 1, "topic": 1},
            "timestamp_topic_search",
            None,
        )
        .await;

        info!("mongo indexes ensured");
        Ok(())
    }

    async fn ensure_timestamp_search(&self, collection: &str) {
        let coll = self.database().collection::<Document>(collection);
        ensure_index(&coll, doc! {"timestamp": 1}, "timestamp_search", None).await;
    }

    async fn ensure_timestamp_ttl(&self, collection: &str, ttl_secs: u64) {
        if ttl_secs == 0 {
            return;
        }
        let coll = self.database().collection::<Document>(collection);
        ensure_index(
            &coll,
            doc! {"timestamp": 1},
            "timestamp_ttl",
            Some(Duration::from_secs(ttl_secs)),
        )
        .await;
    }

    /// Create the solar collections as time-series when the server supports
    /// them, falling back to plain collections otherwise, and add the
    /// per-gateway lookup index.
    pub async fn ensure_solar_collections(&self, retention: &RetentionConfig) {
        let tiers: [(&str, Option<u64>); 3] = [
            ("solar_data", None),
            ("today_solar_data", Some(retention.today_ttl_secs)),
            ("current_month_solar_data", Some(retention.last_30_days_ttl_secs)),
        ];
        for (name, expire_secs) in tiers {
            self.create_timeseries(name, expire_secs).await;
        }

        let solar = self.database().collection::<Document>("solar_data");
        ensure_index(
            &solar,
            doc! {"client_id": 1, "timestamp": -1},
            "client_timestamp_search",
            None,
        )
        .await;
    }

    async fn create_timeseries(&self, name: &str, expire_secs: Option<u64>) {
        let options = TimeseriesOptions::builder()
            .time_field("timestamp".to_string())
            .meta_field(Some("client_id".to_string()))
            .granularity(Some(TimeseriesGranularity::Minutes))
            .build();
        let mut action = self.database().create_collection(name).timeseries(options);
        if let Some(secs) = expire_secs.filter(|s| *s > 0) {
            action = action.expire_after_seconds(Duration::from_secs(secs));
        }
        match action.await {
            Ok(()) => info!(collection = %name, "time-series collection created"),
            // Already-exists or servers without time-series support both land
            // here; inserts into the plain collection still work.
            Err(e) => warn!(collection = %name, error = %e, "time-series creation skipped"),
        }
    }
}

/// Create `name` over `keys`, dropping a same-named index first when its key
/// pattern or TTL no longer matches.
async fn ensure_index(
    collection: &Collection<Document>,
    keys: Document,
    name: &str,
    expire_after: Option<Duration>,
) {
    if let Some(existing) = find_index(collection, name).await {
        let same_keys = existing.keys == keys;
        let same_ttl = existing.options.as_ref().and_then(|o| o.expire_after) == expire_after;
        if same_keys && same_ttl {
            return;
        }
        if let Err(e) = collection.drop_index(name).await {
            warn!(collection = %collection.name(), index = %name, error = %e, "failed dropping index");
        }
    }

    let options = IndexOptions::builder()
        .name(name.to_string())
        .expire_after(expire_after)
        .build();
    let model = IndexModel::builder().keys(keys).options(options).build();
    if let Err(e) = collection.create_index(model).await {
        warn!(collection = %collection.name(), index = %name, error = %e, "failed creating index");
    }
}

async fn find_index(collection: &Collection<Document>, name: &str) -> Option<IndexModel> {
    let mut cursor = collection.list_indexes().await.ok()?;
    while let Ok(Some(model)) = cursor.try_next().await {
        let model_name = model.options.as_ref().and_then(|o| o.name.as_deref());
        if model_name == Some(name) {
            return Some(model);
        }
    }
    None
}
