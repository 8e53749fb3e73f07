//! Document store adapter over the shared Mongo client.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Bson, DateTime as BsonDateTime, Document};
use mongodb::{Client, Database};
use serde_json::Value;
use tracing::debug;

use gridpulse_core::config::MongoConfig;
use gridpulse_core::message::{normalize_timestamp, CanonicalMessage};
use gridpulse_core::topics::collections_for_topic;

use crate::error::StoreError;

/// Process-wide store handle; cheap to clone (the driver pools connections).
#[derive(Clone)]
pub struct TelemetryStore {
    db: Database,
    fallback_collection: String,
}

/// A source document read back for aggregation.
#[derive(Debug, Clone)]
pub struct SourceDoc {
    pub device_id: Option<String>,
    pub topic: Option<String>,
    pub payload: Value,
}

/// An averaged document destined for a downsampled tier.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDoc {
    pub topic: String,
    pub device_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<(String, f64)>,
}

impl TelemetryStore {
    /// Connect using the configured URI; fails fast when unconfigured.
    pub async fn connect(config: &MongoConfig) -> Result<Self, StoreError> {
        let uri = config.uri.as_deref().ok_or(StoreError::NotConfigured)?;
        let client = Client::with_uri_str(uri).await?;
        let db = client
            .default_database()
            .unwrap_or_else(|| client.database(&config.database));
        Ok(Self {
            db,
            fallback_collection: config.fallback_collection.clone(),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Check store connectivity.
    pub async fn ping(&self) -> bool {
        self.db.run_command(doc! {"ping": 1}).await.is_ok()
    }

    /// Persist a canonical message into its routed collections plus the
    /// `telemetry_events` audit mirror.
    ///
    /// The envelope timestamp is normalised to a UTC instant; when it cannot
    /// be parsed the raw value is stored untouched.
    pub async fn store_event(&self, message: &CanonicalMessage) -> Result<(), StoreError> {
        let document = self.message_document(message)?;
        for collection in collections_for_topic(&message.topic, &self.fallback_collection) {
            self.db
                .collection::<Document>(collection)
                .insert_one(document.clone())
                .await?;
        }
        self.db
            .collection::<Document>("telemetry_events")
            .insert_one(document)
            .await?;
        debug!(topic = %message.topic, "stored telemetry event");
        Ok(())
    }

    fn message_document(&self, message: &CanonicalMessage) -> Result<Document, StoreError> {
        let timestamp = match normalize_timestamp(&message.timestamp) {
            Some(dt) => Bson::DateTime(BsonDateTime::from_millis(dt.timestamp_millis())),
            None => to_bson(&message.timestamp)?,
        };
        let mut document = doc! {
            "device_id": message.device_id.clone(),
            "topic": &message.topic,
            "payload": to_bson(&message.payload)?,
        };
        document.insert("timestamp", timestamp);
        Ok(document)
    }

    /// Read `[start, end)` source documents for a rollup pass.
    pub async fn read_window(
        &self,
        collection: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SourceDoc>, StoreError> {
        let filter = doc! {
            "timestamp": {
                "$gte": BsonDateTime::from_millis(start.timestamp_millis()),
                "$lt": BsonDateTime::from_millis(end.timestamp_millis()),
            }
        };
        let mut cursor = self
            .db
            .collection::<Document>(collection)
            .find(filter)
            .projection(doc! {"payload": 1, "topic": 1, "device_id": 1})
            .await?;

        let mut docs = Vec::new();
        while let Some(raw) = cursor.try_next().await? {
            docs.push(SourceDoc {
                device_id: raw.get_str("device_id").ok().map(|s| s.to_string()),
                topic: raw.get_str("topic").ok().map(|s| s.to_string()),
                payload: raw
                    .get("payload")
                    .and_then(|b| mongodb::bson::from_bson::<Value>(b.clone()).ok())
                    .unwrap_or(Value::Null),
            });
        }
        Ok(docs)
    }

    /// Idempotency guard: does the target tier already hold a document for
    /// this `(timestamp, device_id, topic)` key?
    pub async fn aggregate_exists(
        &self,
        collection: &str,
        timestamp: DateTime<Utc>,
        device_id: Option<&str>,
        topic: &str,
    ) -> Result<bool, StoreError> {
        let filter = doc! {
            "timestamp": BsonDateTime::from_millis(timestamp.timestamp_millis()),
            "device_id": device_id,
            "topic": topic,
        };
        let existing = self
            .db
            .collection::<Document>(collection)
            .find_one(filter)
            .projection(doc! {"_id": 1})
            .await?;
        Ok(existing.is_some())
    }

    /// Insert one averaged document into a downsampled tier.
    pub async fn insert_aggregate(
        &self,
        collection: &str,
        aggregate: &AggregateDoc,
    ) -> Result<(), StoreError> {
        let mut payload = Document::new();
        for (field, value) in &aggregate.payload {
            payload.insert(field.clone(), *value);
        }
        let document = doc! {
            "topic": &aggregate.topic,
            "device_id": aggregate.device_id.clone(),
            "timestamp": BsonDateTime::from_millis(aggregate.timestamp.timestamp_millis()),
            "payload": payload,
        };
        self.db
            .collection::<Document>(collection)
            .insert_one(document)
            .await?;
        Ok(())
    }
}
