//! In-process group bus over tokio broadcast channels.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{BusEvent, GroupBus};

const GROUP_CHANNEL_CAPACITY: usize = 64;

/// One broadcast channel per group, created lazily on first use.
///
/// Subscribers that fall behind by more than the channel capacity miss
/// messages (broadcast-channel lag), which matches the bus contract of
/// best-effort realtime delivery.
pub struct LocalBus {
    groups: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a group, creating its channel if needed.
    pub fn subscribe(&self, group: &str) -> broadcast::Receiver<String> {
        self.sender(group).subscribe()
    }

    /// Number of live subscribers across all groups.
    pub fn subscriber_count(&self) -> usize {
        let groups = self.groups.read().unwrap_or_else(|e| e.into_inner());
        groups.values().map(|tx| tx.receiver_count()).sum()
    }

    fn sender(&self, group: &str) -> broadcast::Sender<String> {
        {
            let groups = self.groups.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = groups.get(group) {
                return tx.clone();
            }
        }
        let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish a pre-serialised message body to a group.
    pub fn send_raw(&self, group: &str, body: String) {
        // send() errs only when there are no subscribers; that is fine.
        let _ = self.sender(group).send(body);
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupBus for LocalBus {
    async fn publish(&self, group: &str, event: BusEvent) {
        match serde_json::to_string(&event) {
            Ok(body) => self.send_raw(group, body),
            Err(e) => warn!(group = %group, error = %e, "failed to serialize bus event"),
        }
    }
}
