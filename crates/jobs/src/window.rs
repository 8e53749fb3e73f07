//! Time-window snapping and numeric averaging for rollup passes.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::Value;

use gridpulse_core::normalize::{coerce_number, round3};
use gridpulse_store::{AggregateDoc, SourceDoc};

/// How `now` is truncated before deriving the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snap {
    /// Truncate seconds (minute-aligned jobs).
    Minute,
    /// Truncate minutes and seconds (hour-aligned jobs).
    Hour,
}

/// Derive `[window_start, window_end)` from the invocation instant.
pub fn window_bounds(now: DateTime<Utc>, snap: Snap, window: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    let snapped = match snap {
        Snap::Minute => now.with_second(0).and_then(|t| t.with_nanosecond(0)),
        Snap::Hour => now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0)),
    }
    .unwrap_or(now);
    (snapped - window, snapped)
}

/// Average the window's documents per `(device_id, topic)` group.
///
/// Each numeric (or numeric-string) payload field accumulates a sum and
/// count; other values are skipped. Averages are rounded to three decimals.
/// Fields that never produced a number are omitted; groups whose payloads
/// held no numbers at all yield an empty payload, matching a source whose
/// fields are all textual.
pub fn average_window(
    docs: &[SourceDoc],
    default_topic: &str,
    window_end: DateTime<Utc>,
) -> Vec<AggregateDoc> {
    type FieldAcc = BTreeMap<String, (f64, u64)>;
    let mut groups: BTreeMap<(Option<String>, String), FieldAcc> = BTreeMap::new();

    for doc in docs {
        let topic = doc
            .topic
            .clone()
            .unwrap_or_else(|| default_topic.to_string());
        let key = (doc.device_id.clone(), topic);
        let fields = groups.entry(key).or_default();
        let payload = match &doc.payload {
            Value::Object(map) => map,
            _ => continue,
        };
        for (field, value) in payload {
            let Some(number) = coerce_number(value) else {
                continue;
            };
            let entry = fields.entry(field.clone()).or_insert((0.0, 0));
            entry.0 += number;
            entry.1 += 1;
        }
    }

    groups
        .into_iter()
        .map(|((device_id, topic), fields)| AggregateDoc {
            topic,
            device_id,
            timestamp: window_end,
            payload: fields
                .into_iter()
                .filter(|(_, (_, count))| *count > 0)
                .map(|(field, (sum, count))| (field, round3(sum / count as f64)))
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn doc(device: Option<&str>, topic: Option<&str>, payload: Value) -> SourceDoc {
        SourceDoc {
            device_id: device.map(|s| s.to_string()),
            topic: topic.map(|s| s.to_string()),
            payload,
        }
    }

    #[test]
    fn test_minute_snap_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 7, 42).unwrap();
        let (start, end) = window_bounds(now, Snap::Minute, Duration::minutes(1));
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 6, 1, 12, 7, 0).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 1, 12, 6, 0).unwrap());
    }

    #[test]
    fn test_hour_snap_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 37, 42).unwrap();
        let (start, end) = window_bounds(now, Snap::Hour, Duration::hours(3));
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_averages_per_group() {
        let window_end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let docs = vec![
            doc(Some("dev1"), Some("MQTT_RT_DATA"), json!({"ua": 1.0})),
            doc(Some("dev1"), Some("MQTT_RT_DATA"), json!({"ua": 2.0})),
            doc(Some("dev1"), Some("MQTT_RT_DATA"), json!({"ua": 3.0})),
        ];
        let aggregates = average_window(&docs, "MQTT_RT_DATA", window_end);
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].timestamp, window_end);
        assert_eq!(aggregates[0].payload, vec![("ua".to_string(), 2.0)]);
    }

    #[test]
    fn test_devices_do_not_mix() {
        let window_end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let docs = vec![
            doc(Some("dev1"), Some("MQTT_RT_DATA"), json!({"ua": 1.0})),
            doc(Some("dev2"), Some("MQTT_RT_DATA"), json!({"ua": 5.0})),
        ];
        let aggregates = average_window(&docs, "MQTT_RT_DATA", window_end);
        assert_eq!(aggregates.len(), 2);
        let by_device: Vec<_> = aggregates
            .iter()
            .map(|a| (a.device_id.as_deref().unwrap(), a.payload[0].1))
            .collect();
        assert!(by_device.contains(&("dev1", 1.0)));
        assert!(by_device.contains(&("dev2", 5.0)));
    }

    #[test]
    fn test_numeric_strings_count_and_text_skipped() {
        let window_end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let docs = vec![
            doc(Some("dev1"), None, json!({"ua": "2.5", "isend": "1", "label": "ok"})),
            doc(Some("dev1"), None, json!({"ua": 3.5, "label": "ok"})),
        ];
        let aggregates = average_window(&docs, "MQTT_RT_DATA", window_end);
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].topic, "MQTT_RT_DATA");
        // "isend" is the parseable string "1"; "label" never parses.
        let fields: Vec<&str> = aggregates[0].payload.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(fields, vec!["isend", "ua"]);
        let ua = aggregates[0].payload.iter().find(|(f, _)| f == "ua").unwrap();
        assert_eq!(ua.1, 3.0);
    }

    #[test]
    fn test_rounds_to_three_decimals() {
        let window_end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let docs = vec![
            doc(Some("dev1"), None, json!({"f": 1.0})),
            doc(Some("dev1"), None, json!({"f": 1.0})),
            doc(Some("dev1"), None, json!({"f": 2.0})),
        ];
        let aggregates = average_window(&docs, "t", window_end);
        assert_eq!(aggregates[0].payload, vec![("f".to_string(), 1.333)]);
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        let window_end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(average_window(&[], "t", window_end).is_empty());
    }
}
