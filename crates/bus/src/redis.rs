//! Redis-backed group bus.
//!
//! Each group maps to one pub/sub channel; the gateway subscribes to the
//! same channels and forwards message bodies to its WebSocket clients.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::{BusEvent, GroupBus};

/// Pub/sub channel name for a broadcast group.
pub fn channel_for_group(group: &str) -> String {
    format!("ws:{group}")
}

/// Group bus publishing through Redis pub/sub.
#[derive(Clone)]
pub struct RedisBus {
    conn: ConnectionManager,
}

impl RedisBus {
    /// Connect to Redis; the connection manager reconnects on its own.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl GroupBus for RedisBus {
    async fn publish(&self, group: &str, event: BusEvent) {
        let body = match serde_json::to_string(&event) {
            Ok(body) => body,
            Err(e) => {
                warn!(group = %group, error = %e, "failed to serialize bus event");
                return;
            }
        };
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> =
            conn.publish(channel_for_group(group), body).await;
        if let Err(e) = result {
            warn!(group = %group, error = %e, "bus publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_naming() {
        assert_eq!(channel_for_group("telemetry"), "ws:telemetry");
        assert_eq!(channel_for_group("tcp_telemetry"), "ws:tcp_telemetry");
    }
}
