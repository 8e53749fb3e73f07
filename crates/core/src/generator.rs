//! Generator meter payload flattening.
//!
//! The `CCCL/PURBACHAL/ENM_01` meter publishes
//! `{"data": [{"tp": <epoch_ms>, "point": [{"id": ..., "val": ...}, ...]}]}`.
//! Downstream consumers expect the flat shape
//! `{"timestamp": <epoch_ms>, "<id>": <val>, ...}`.

use serde_json::{Map, Value};

use crate::message::CanonicalMessage;

/// Flatten a generator message payload in place.
///
/// Only entries with a non-null `id` are retained. Payloads that do not
/// match the expected shape (missing `data[0]`, or a non-mapping first
/// element) pass through unchanged.
pub fn flatten_generator_message(message: CanonicalMessage) -> CanonicalMessage {
    let payload = match &message.payload {
        Value::Object(map) => map,
        _ => return message,
    };
    let data_point = match payload.get("data").and_then(|d| d.get(0)) {
        Some(Value::Object(map)) if !map.is_empty() => map,
        _ => return message,
    };

    let mut flattened = Map::new();
    flattened.insert(
        "timestamp".to_string(),
        data_point.get("tp").cloned().unwrap_or(Value::Null),
    );
    if let Some(Value::Array(points)) = data_point.get("point") {
        for point in points {
            let id = match point.get("id") {
                Some(Value::Null) | None => continue,
                Some(id) => id,
            };
            let key = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            flattened.insert(key, point.get("val").cloned().unwrap_or(Value::Null));
        }
    }

    CanonicalMessage {
        payload: Value::Object(flattened),
        ..message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(payload: Value) -> CanonicalMessage {
        CanonicalMessage {
            device_id: Some("gen1".to_string()),
            topic: "CCCL/PURBACHAL/ENM_01".to_string(),
            timestamp: json!("2024-01-01T00:00:00Z"),
            payload,
        }
    }

    #[test]
    fn test_flattens_points() {
        let msg = message(json!({
            "data": [{"tp": 1700000000000i64, "point": [
                {"id": "e1", "val": 10.5},
                {"id": "e2", "val": 20},
            ]}]
        }));
        let flat = flatten_generator_message(msg);
        assert_eq!(flat.payload.get("timestamp"), Some(&json!(1700000000000i64)));
        assert_eq!(flat.payload.get("e1"), Some(&json!(10.5)));
        assert_eq!(flat.payload.get("e2"), Some(&json!(20)));
    }

    #[test]
    fn test_null_ids_are_skipped() {
        let msg = message(json!({
            "data": [{"tp": 1, "point": [
                {"id": null, "val": 1},
                {"id": "ok", "val": 2},
            ]}]
        }));
        let flat = flatten_generator_message(msg);
        assert_eq!(flat.payload.as_object().unwrap().len(), 2); // timestamp + ok
        assert_eq!(flat.payload.get("ok"), Some(&json!(2)));
    }

    #[test]
    fn test_invalid_shape_passes_through() {
        let original = json!({"something": "else"});
        let flat = flatten_generator_message(message(original.clone()));
        assert_eq!(flat.payload, original);

        let empty_first = json!({"data": [{}]});
        let flat = flatten_generator_message(message(empty_first.clone()));
        assert_eq!(flat.payload, empty_first);

        let non_dict = json!({"data": ["oops"]});
        let flat = flatten_generator_message(message(non_dict.clone()));
        assert_eq!(flat.payload, non_dict);
    }

    #[test]
    fn test_non_mapping_payload_passes_through() {
        let flat = flatten_generator_message(message(json!("raw")));
        assert_eq!(flat.payload, json!("raw"));
    }
}
