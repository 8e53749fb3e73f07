//! Inbound message envelope and the bounded ingest queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use crate::metrics::IngestMetrics;

/// A raw MQTT publish captured off the event loop.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub topic: String,
    pub qos: u8,
    pub retained: bool,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Producer side of the single-consumer ingest queue.
///
/// With drop-on-full enabled the broker side never blocks: the newest
/// envelope is dropped and counted. Otherwise `enqueue` waits for space.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<MessageEnvelope>,
    drop_on_full: bool,
    metrics: Arc<IngestMetrics>,
}

impl IngestQueue {
    pub fn bounded(
        capacity: usize,
        drop_on_full: bool,
        metrics: Arc<IngestMetrics>,
    ) -> (Self, mpsc::Receiver<MessageEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                drop_on_full,
                metrics,
            },
            rx,
        )
    }

    pub async fn enqueue(&self, envelope: MessageEnvelope) {
        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.metrics.queue_size.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                if self.drop_on_full {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %envelope.topic, "message queue full; dropping");
                } else if self.tx.send(envelope).await.is_ok() {
                    self.metrics.queue_size.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                warn!(topic = %envelope.topic, "ingest worker stopped; dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(topic: &str) -> MessageEnvelope {
        MessageEnvelope {
            topic: topic.to_string(),
            qos: 0,
            retained: false,
            payload: b"{}".to_vec(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_drop_on_full_never_blocks() {
        let metrics = Arc::new(IngestMetrics::default());
        let (queue, _rx) = IngestQueue::bounded(2, true, metrics.clone());
        for n in 0..5 {
            queue.enqueue(envelope(&format!("t{n}"))).await;
        }
        // 2 accepted, 3 dropped: produced - consumed == dropped.
        assert_eq!(metrics.dropped.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.queue_size.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_enqueue_counts_queue_size() {
        let metrics = Arc::new(IngestMetrics::default());
        let (queue, mut rx) = IngestQueue::bounded(10, true, metrics.clone());
        queue.enqueue(envelope("a")).await;
        queue.enqueue(envelope("b")).await;
        assert_eq!(metrics.queue_size.load(Ordering::Relaxed), 2);
        assert_eq!(rx.recv().await.unwrap().topic, "a");
    }
}
