//! Canonical telemetry message and timestamp handling.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The unit flowing through the ingest core after normalisation.
///
/// `timestamp` keeps whatever the transport delivered (epoch-ms number,
/// numeric string, or ISO-8601 text); it is converted to a UTC instant by
/// [`normalize_timestamp`] when the message is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub device_id: Option<String>,
    pub topic: String,
    pub timestamp: Value,
    pub payload: Value,
}

impl CanonicalMessage {
    /// Build a message from a decoded payload.
    ///
    /// For mapping payloads the device id is read from `id` (preferred) or
    /// `device_id`, and `id` is stripped from the stored payload. Non-mapping
    /// payloads are carried as-is with no device id; validation decides their
    /// fate downstream.
    pub fn from_payload(topic: &str, timestamp: Value, payload: Value) -> Self {
        match payload {
            Value::Object(mut map) => {
                let device_id = map
                    .get("id")
                    .and_then(value_as_string)
                    .filter(|s| !s.is_empty())
                    .or_else(|| {
                        map.get("device_id")
                            .and_then(value_as_string)
                            .filter(|s| !s.is_empty())
                    });
                map.remove("id");
                Self {
                    device_id,
                    topic: topic.to_string(),
                    timestamp,
                    payload: Value::Object(map),
                }
            }
            other => Self {
                device_id: None,
                topic: topic.to_string(),
                timestamp,
                payload: other,
            },
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalise a timestamp value to a UTC instant.
///
/// Accepted inputs: epoch-ms integer or float, a digit-only string of
/// epoch-ms, or an ISO-8601 datetime string. Naive datetimes are taken as
/// UTC. Anything else yields `None`.
pub fn normalize_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = if let Some(i) = n.as_i64() {
                i
            } else {
                n.as_f64()? as i64
            };
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => {
            let stripped = s.trim();
            if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
                let millis: i64 = stripped.parse().ok()?;
                return Utc.timestamp_millis_opt(millis).single();
            }
            parse_datetime(stripped)
        }
        _ => None,
    }
}

/// Parse an ISO-8601 datetime, tolerating a missing offset (assumed UTC)
/// and a space separator in place of `T`.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let candidate = s.replace(' ', "T");
    if let Ok(dt) = DateTime::parse_from_rfc3339(&candidate) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&candidate, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}
