//! Per-(topic, device) liveness tracking.
//!
//! Each topic keeps a sorted set `telemetry:devices:{topic}` whose members
//! are device ids scored by last-seen epoch seconds, plus a status memo
//! `telemetry:status:{topic}:{device_id}` of `online`/`offline`. A fresh
//! ingest touches the set and rewrites the memo to `online`; the periodic
//! scan flips stale devices to `offline` exactly once per transition.

pub mod index;

use serde::Serialize;
use thiserror::Error;

pub use index::LivenessIndex;

use gridpulse_core::config::LivenessConfig;
use gridpulse_core::topics;

#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A device that crossed its staleness threshold on this scan.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OfflineTransition {
    pub device_id: String,
    pub last_seen: i64,
    pub topic: String,
}

pub fn devices_key(topic: &str) -> String {
    format!("telemetry:devices:{topic}")
}

pub fn status_key(topic: &str, device_id: &str) -> String {
    format!("telemetry:status:{topic}:{device_id}")
}

/// The scanned topics and their staleness thresholds in seconds.
pub fn staleness_thresholds(config: &LivenessConfig) -> Vec<(&'static str, i64)> {
    vec![
        (topics::RT_DATA, config.rt_stale_secs),
        (topics::ENV_01, config.env_stale_secs),
        (topics::ENY_NOW, config.eny_now_stale_secs),
        (topics::TCP_SOLAR, config.solar_stale_secs),
    ]
}

/// Decide which stale members transition to offline, given their memos.
///
/// Members already memoised as `offline` are skipped so each transition
/// broadcasts exactly once.
pub fn plan_transitions(
    topic: &str,
    stale_members: &[(String, i64)],
    memos: &[Option<String>],
) -> Vec<OfflineTransition> {
    stale_members
        .iter()
        .zip(memos)
        .filter(|(_, memo)| memo.as_deref() != Some("offline"))
        .map(|((device_id, last_seen), _)| OfflineTransition {
            device_id: device_id.clone(),
            last_seen: *last_seen,
            topic: topic.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(devices_key("MQTT_RT_DATA"), "telemetry:devices:MQTT_RT_DATA");
        assert_eq!(
            status_key("MQTT_RT_DATA", "dev1"),
            "telemetry:status:MQTT_RT_DATA:dev1"
        );
    }

    #[test]
    fn test_thresholds_cover_all_tracked_topics() {
        let config = LivenessConfig {
            rt_stale_secs: 60,
            env_stale_secs: 60,
            eny_now_stale_secs: 1020,
            solar_stale_secs: 150,
            device_track_secs: 86_400,
        };
        let thresholds = staleness_thresholds(&config);
        assert_eq!(thresholds.len(), 4);
        assert!(thresholds.contains(&("TCP_SOLAR_DATA", 150)));
    }

    #[test]
    fn test_plan_skips_already_offline() {
        let stale = vec![
            ("dev1".to_string(), 100),
            ("dev2".to_string(), 200),
            ("dev3".to_string(), 300),
        ];
        let memos = vec![
            Some("online".to_string()),
            Some("offline".to_string()),
            None,
        ];
        let transitions = plan_transitions("MQTT_RT_DATA", &stale, &memos);
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].device_id, "dev1");
        assert_eq!(transitions[0].last_seen, 100);
        assert_eq!(transitions[1].device_id, "dev3");
    }

    #[test]
    fn test_plan_empty_when_no_stale_members() {
        assert!(plan_transitions("MQTT_RT_DATA", &[], &[]).is_empty());
    }
}
