//! Named-group broadcast bus.
//!
//! Publishers hand a [`BusEvent`] to a group; every listener subscribed to
//! that group receives it. Two backings: [`RedisBus`] fans out across
//! processes via Redis pub/sub, [`LocalBus`] is an in-process ring used by
//! the gateway's WebSocket handlers and by tests. A failed publish is logged
//! and swallowed — it never surfaces into the caller.

pub mod local;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use local::LocalBus;
pub use redis::{channel_for_group, RedisBus};

/// Event kind for MQTT realtime messages.
pub const TELEMETRY_MESSAGE: &str = "telemetry.message";
/// Event kind for TCP solar messages.
pub const TCP_MESSAGE: &str = "tcp.message";
/// Event kind for device online/offline transitions.
pub const DEVICE_STATUS: &str = "device.status";

/// A message routed to a broadcast group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Event kind routed to subscribers' handlers.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: Value,
}

impl BusEvent {
    pub fn new(kind: &str, message: Value) -> Self {
        Self {
            kind: kind.to_string(),
            message,
        }
    }
}

/// Deliver a message to all listeners in a named group.
#[async_trait]
pub trait GroupBus: Send + Sync {
    /// Publish asynchronously; failures are logged, never propagated.
    async fn publish(&self, group: &str, event: BusEvent);
}
