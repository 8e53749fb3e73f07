//! Batched writer for solar tier collections.
//!
//! A single background worker drains a bounded queue and flushes when
//! either the size threshold or the time window is reached, whichever
//! comes first. Writes to the three solar tiers are serialised under one
//! lock to cap concurrent connections on the shared client.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::solar::SolarDocument;
use crate::store::TelemetryStore;

const SOLAR_TIER_COLLECTIONS: [&str; 3] =
    ["solar_data", "today_solar_data", "current_month_solar_data"];

/// Counters shared between the writer task and the health endpoint.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    pub messages_queued: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub mongo_errors_total: AtomicU64,
    pub queue_size: AtomicI64,
}

/// Size/time batch accumulator for solar documents.
///
/// Flushes when either the size threshold OR the time window is reached.
pub struct SolarBatcher {
    buffer: Vec<SolarDocument>,
    max_size: usize,
    max_wait: Duration,
    batch_started: Option<Instant>,
}

impl SolarBatcher {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(max_size),
            max_size,
            max_wait,
            batch_started: None,
        }
    }

    /// Add a document, starting the batch timer on the first push.
    pub fn push(&mut self, document: SolarDocument) {
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }
        self.buffer.push(document);
    }

    pub fn should_flush(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        if self.buffer.len() >= self.max_size {
            return true;
        }
        matches!(self.batch_started, Some(started) if started.elapsed() >= self.max_wait)
    }

    /// Take the accumulated batch and reset for the next one.
    pub fn flush(&mut self) -> Vec<SolarDocument> {
        self.batch_started = None;
        std::mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Producer-side handle to the batch writer.
#[derive(Clone)]
pub struct SolarBatchHandle {
    tx: mpsc::Sender<SolarDocument>,
    metrics: Arc<WriterMetrics>,
}

impl SolarBatchHandle {
    /// Enqueue without blocking; returns `false` when the queue is full and
    /// the document was dropped.
    pub fn enqueue(&self, document: SolarDocument) -> bool {
        match self.tx.try_send(document) {
            Ok(()) => {
                self.metrics.messages_queued.fetch_add(1, Ordering::Relaxed);
                self.metrics.queue_size.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(doc)) => {
                warn!(client_id = %doc.client_id, "tcp queue full; dropping payload");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("batch writer stopped; dropping payload");
                false
            }
        }
    }

    pub fn metrics(&self) -> Arc<WriterMetrics> {
        self.metrics.clone()
    }
}

/// Background worker flushing solar documents into the tier collections.
pub struct SolarBatchWriter;

impl SolarBatchWriter {
    /// Spawn the writer task. Dropping every [`SolarBatchHandle`] makes the
    /// worker flush its remainder and exit.
    pub fn spawn(
        store: TelemetryStore,
        queue_size: usize,
        batch_size: usize,
        batch_flush_ms: u64,
    ) -> (SolarBatchHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let metrics = Arc::new(WriterMetrics::default());
        let handle = SolarBatchHandle {
            tx,
            metrics: metrics.clone(),
        };
        let worker = tokio::spawn(Self::run(
            store,
            rx,
            metrics,
            batch_size,
            Duration::from_millis(batch_flush_ms),
        ));
        (handle, worker)
    }

    async fn run(
        store: TelemetryStore,
        mut rx: mpsc::Receiver<SolarDocument>,
        metrics: Arc<WriterMetrics>,
        batch_size: usize,
        max_wait: Duration,
    ) {
        let write_lock = Mutex::new(());
        let mut batcher = SolarBatcher::new(batch_size, max_wait);

        loop {
            let wait = Duration::from_millis(100).min(max_wait);
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(document)) => {
                    metrics.queue_size.fetch_sub(1, Ordering::Relaxed);
                    batcher.push(document);
                }
                Ok(None) => break,
                Err(_) => {}
            }
            if batcher.should_flush() {
                Self::flush(&store, &write_lock, batcher.flush(), &metrics).await;
            }
        }

        // Channel closed: drain whatever is left and flush once more.
        while let Ok(document) = rx.try_recv() {
            metrics.queue_size.fetch_sub(1, Ordering::Relaxed);
            batcher.push(document);
        }
        if !batcher.is_empty() {
            Self::flush(&store, &write_lock, batcher.flush(), &metrics).await;
        }
        info!("solar batch writer stopped");
    }

    async fn flush(
        store: &TelemetryStore,
        write_lock: &Mutex<()>,
        batch: Vec<SolarDocument>,
        metrics: &WriterMetrics,
    ) {
        if batch.is_empty() {
            return;
        }
        let documents: Vec<_> = batch.iter().map(SolarDocument::to_document).collect();
        let _guard = write_lock.lock().await;
        for collection in SOLAR_TIER_COLLECTIONS {
            let result = store
                .database()
                .collection::<mongodb::bson::Document>(collection)
                .insert_many(documents.clone())
                .ordered(false)
                .await;
            if let Err(e) = result {
                error!(collection = %collection, error = %e, "mongo batch insert error");
                metrics.mongo_errors_total.fetch_add(1, Ordering::Relaxed);
                // The batch is not retried; upstream sampling refills soon.
                return;
            }
        }
        metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
        info!(records = documents.len(), "stored tcp records");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_document(n: usize) -> SolarDocument {
        SolarDocument {
            timestamp: Utc::now(),
            client_id: format!("10.0.0.{n}:5000"),
            current: vec![1.0],
            power: vec![2.0],
            energy_consumption: vec![3.0],
        }
    }

    #[test]
    fn test_flush_on_size() {
        let mut batcher = SolarBatcher::new(3, Duration::from_secs(60));
        for n in 0..3 {
            batcher.push(make_document(n));
        }
        assert!(batcher.should_flush());
    }

    #[test]
    fn test_no_flush_below_size() {
        let mut batcher = SolarBatcher::new(5, Duration::from_secs(60));
        batcher.push(make_document(0));
        assert!(!batcher.should_flush());
    }

    #[test]
    fn test_flush_on_timeout() {
        let mut batcher = SolarBatcher::new(100, Duration::from_millis(10));
        batcher.push(make_document(0));
        std::thread::sleep(Duration::from_millis(20));
        assert!(batcher.should_flush());
    }

    #[test]
    fn test_flush_resets_state() {
        let mut batcher = SolarBatcher::new(2, Duration::from_secs(60));
        for n in 0..3 {
            batcher.push(make_document(n));
        }
        let flushed = batcher.flush();
        assert_eq!(flushed.len(), 3);
        assert!(batcher.is_empty());
        assert!(!batcher.should_flush());
    }

    #[test]
    fn test_empty_batcher_never_flushes() {
        let batcher = SolarBatcher::new(1, Duration::from_millis(0));
        assert!(!batcher.should_flush());
    }
}
