//! Envelope validation for ingested messages.

use serde_json::Value;

use crate::config::ValidationConfig;
use crate::error::ValidationError;
use crate::message::CanonicalMessage;

/// Check the message envelope against the configured validation policy.
///
/// Always required: a non-empty topic, a present timestamp, and a mapping
/// payload. Topics listed in `required_topics` must additionally carry
/// `time` and `isend` plus any operator-configured payload fields. Topics
/// listed in `require_device_id_topics` must carry a non-empty device id.
/// Invalid messages are dropped by the caller with a warning; validation
/// never stops the pipeline.
pub fn validate_message(
    message: &CanonicalMessage,
    config: &ValidationConfig,
) -> Result<(), ValidationError> {
    if message.topic.is_empty() {
        return Err(ValidationError::MissingTopic);
    }
    match &message.timestamp {
        Value::Null => return Err(ValidationError::MissingTimestamp),
        Value::String(s) if s.is_empty() => return Err(ValidationError::MissingTimestamp),
        _ => {}
    }
    let payload = match &message.payload {
        Value::Object(map) => map,
        _ => return Err(ValidationError::PayloadNotMapping),
    };

    if config
        .require_device_id_topics
        .iter()
        .any(|t| t == &message.topic)
        && message.device_id.as_deref().unwrap_or("").is_empty()
    {
        return Err(ValidationError::MissingDeviceId);
    }

    if config.required_topics.iter().any(|t| t == &message.topic) {
        if !payload.contains_key("time") {
            return Err(ValidationError::MissingPayloadField("time".to_string()));
        }
        if !payload.contains_key("isend") {
            return Err(ValidationError::MissingPayloadField("isend".to_string()));
        }
        for field in &config.required_payload_fields {
            if !payload.contains_key(field) {
                return Err(ValidationError::MissingPayloadField(field.clone()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(topic: &str, device_id: Option<&str>, payload: Value) -> CanonicalMessage {
        CanonicalMessage {
            device_id: device_id.map(|s| s.to_string()),
            topic: topic.to_string(),
            timestamp: json!("2024-01-01T00:00:00Z"),
            payload,
        }
    }

    fn strict_config() -> ValidationConfig {
        ValidationConfig {
            required_topics: vec!["MQTT_RT_DATA".to_string()],
            required_payload_fields: vec!["ua".to_string()],
            require_device_id_topics: vec!["MQTT_RT_DATA".to_string()],
        }
    }

    #[test]
    fn test_valid_strict_message() {
        let msg = message(
            "MQTT_RT_DATA",
            Some("dev1"),
            json!({"time": "t1", "isend": "1", "ua": 1.0}),
        );
        assert!(validate_message(&msg, &strict_config()).is_ok());
    }

    #[test]
    fn test_non_mapping_payload_rejected() {
        let msg = message("MQTT_RT_DATA", Some("dev1"), json!("deadbeef"));
        assert_eq!(
            validate_message(&msg, &ValidationConfig::default()),
            Err(ValidationError::PayloadNotMapping)
        );
    }

    #[test]
    fn test_empty_topic_rejected() {
        let msg = message("", None, json!({}));
        assert_eq!(
            validate_message(&msg, &ValidationConfig::default()),
            Err(ValidationError::MissingTopic)
        );
    }

    #[test]
    fn test_null_timestamp_rejected() {
        let mut msg = message("MQTT_RT_DATA", None, json!({}));
        msg.timestamp = Value::Null;
        assert_eq!(
            validate_message(&msg, &ValidationConfig::default()),
            Err(ValidationError::MissingTimestamp)
        );
    }

    #[test]
    fn test_strict_topic_requires_time_and_isend() {
        let msg = message("MQTT_RT_DATA", Some("dev1"), json!({"ua": 1.0}));
        assert_eq!(
            validate_message(&msg, &strict_config()),
            Err(ValidationError::MissingPayloadField("time".to_string()))
        );
    }

    #[test]
    fn test_strict_topic_requires_configured_fields() {
        let msg = message(
            "MQTT_RT_DATA",
            Some("dev1"),
            json!({"time": "t1", "isend": "1"}),
        );
        assert_eq!(
            validate_message(&msg, &strict_config()),
            Err(ValidationError::MissingPayloadField("ua".to_string()))
        );
    }

    #[test]
    fn test_device_id_required_only_for_listed_topics() {
        let msg = message("MQTT_RT_DATA", None, json!({"time": "t", "isend": "1", "ua": 1}));
        assert_eq!(
            validate_message(&msg, &strict_config()),
            Err(ValidationError::MissingDeviceId)
        );

        // Topics outside the strict set pass without time/isend/device_id.
        let other = message("CCCL/PURBACHAL/ENM_01", None, json!({"timestamp": 1, "e1": 2}));
        assert!(validate_message(&other, &strict_config()).is_ok());
    }
}
