//! Multi-fragment packet reassembly.
//!
//! Devices split large publishes across several MQTT messages. Fragments of
//! one logical packet share a `time` batch id and carry an `isend` flag on
//! which the terminator is `"1"`. Buffers are keyed by `(topic, time)` and
//! merged last-write-wins until the terminator arrives.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::debug;

type BufferKey = (String, Option<String>);

pub struct PacketAssembler {
    buffers: HashMap<BufferKey, Map<String, Value>>,
    stamps: HashMap<BufferKey, Instant>,
    ttl: Duration,
}

impl PacketAssembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            stamps: HashMap::new(),
            ttl,
        }
    }

    /// Offer one payload; returns the payload to emit downstream, or `None`
    /// while a packet is still accumulating.
    ///
    /// Non-mapping payloads and mappings without `isend` pass through
    /// unchanged — they are never buffered.
    pub fn offer(&mut self, topic: &str, payload: Value) -> Option<Value> {
        let map = match payload {
            Value::Object(ref map) => map,
            other => return Some(other),
        };
        let is_end = match map.get("isend") {
            Some(flag) => flag_string(flag),
            None => return Some(payload),
        };

        let key = (topic.to_string(), map.get("time").map(flag_string));
        self.stamps.insert(key.clone(), Instant::now());
        let buffer = self.buffers.entry(key.clone()).or_default();
        for (field, value) in map {
            buffer.insert(field.clone(), value.clone());
        }

        if is_end == "1" {
            self.stamps.remove(&key);
            let assembled = self.buffers.remove(&key).unwrap_or_default();
            Some(Value::Object(assembled))
        } else {
            None
        }
    }

    /// Drop buffers that have not seen a fragment within the TTL.
    pub fn sweep_stale(&mut self) {
        if self.stamps.is_empty() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<BufferKey> = self
            .stamps
            .iter()
            .filter(|(_, stamp)| now.duration_since(**stamp) > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            debug!(topic = %key.0, "dropping stale reassembly buffer");
            self.buffers.remove(&key);
            self.stamps.remove(&key);
        }
    }

    /// Number of in-flight buffers.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

fn flag_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
