//! Single-consumer ingest pipeline.
//!
//! One worker drains the bounded queue: sweep stale buffers, decode,
//! reassemble, normalise, validate, then fan out persist + broadcast on a
//! capped pool and touch the liveness index. A slow fan-out operation is
//! counted and left behind; it never blocks the next dequeue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridpulse_bus::{BusEvent, GroupBus, TELEMETRY_MESSAGE};
use gridpulse_core::config::{IngestConfig, ValidationConfig};
use gridpulse_core::generator::flatten_generator_message;
use gridpulse_core::message::CanonicalMessage;
use gridpulse_core::normalize::normalize_keys;
use gridpulse_core::topics;
use gridpulse_core::validate::validate_message;
use gridpulse_liveness::LivenessIndex;
use gridpulse_store::TelemetryStore;

use crate::assembler::PacketAssembler;
use crate::envelope::MessageEnvelope;
use crate::metrics::IngestMetrics;

/// Persistence seam for the fan-out; the store implements it, tests inject
/// their own.
#[async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    async fn persist(&self, message: CanonicalMessage) -> Result<(), String>;
}

#[async_trait]
impl TelemetrySink for TelemetryStore {
    async fn persist(&self, message: CanonicalMessage) -> Result<(), String> {
        self.store_event(&message).await.map_err(|e| e.to_string())
    }
}

/// Liveness seam mirroring [`TelemetrySink`].
#[async_trait]
pub trait DeviceTracker: Send + Sync + 'static {
    async fn touch(&self, topic: &str, device_id: &str, now_epoch_s: i64) -> Result<(), String>;
}

#[async_trait]
impl DeviceTracker for LivenessIndex {
    async fn touch(&self, topic: &str, device_id: &str, now_epoch_s: i64) -> Result<(), String> {
        LivenessIndex::touch(self, topic, device_id, now_epoch_s)
            .await
            .map_err(|e| e.to_string())
    }
}

pub struct IngestWorker {
    assembler: PacketAssembler,
    validation: ValidationConfig,
    sink: Arc<dyn TelemetrySink>,
    bus: Arc<dyn GroupBus>,
    tracker: Arc<dyn DeviceTracker>,
    metrics: Arc<IngestMetrics>,
    fanout_semaphore: Arc<Semaphore>,
    fanout_timeout: Duration,
    telemetry_group: String,
    shutdown_grace: Duration,
}

impl IngestWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ingest: &IngestConfig,
        validation: ValidationConfig,
        telemetry_group: String,
        sink: Arc<dyn TelemetrySink>,
        bus: Arc<dyn GroupBus>,
        tracker: Arc<dyn DeviceTracker>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            assembler: PacketAssembler::new(Duration::from_secs(ingest.buffer_ttl_secs)),
            validation,
            sink,
            bus,
            tracker,
            metrics,
            fanout_semaphore: Arc::new(Semaphore::new(ingest.fanout_workers.max(1))),
            fanout_timeout: Duration::from_millis(ingest.fanout_timeout_ms),
            telemetry_group,
            shutdown_grace: Duration::from_secs(ingest.shutdown_grace_secs),
        }
    }

    /// Consume envelopes until the stop signal, then drain within the grace
    /// deadline.
    pub async fn run(mut self, mut rx: mpsc::Receiver<MessageEnvelope>, stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(envelope)) => self.handle_envelope(envelope).await,
                Ok(None) => return,
                Err(_) => continue,
            }
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        loop {
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace elapsed with messages still queued");
                break;
            }
            match rx.try_recv() {
                Ok(envelope) => self.handle_envelope(envelope).await,
                Err(_) => break,
            }
        }
        info!("ingest worker stopped");
    }

    pub(crate) async fn handle_envelope(&mut self, envelope: MessageEnvelope) {
        self.metrics.queue_size.fetch_sub(1, Ordering::Relaxed);
        self.assembler.sweep_stale();

        let payload = decode_payload(envelope.payload);
        let assembled = match self.assembler.offer(&envelope.topic, payload) {
            Some(assembled) => assembled,
            None => return,
        };
        let normalized = match assembled {
            Value::Object(ref map) => Value::Object(normalize_keys(map)),
            other => other,
        };

        let timestamp = envelope
            .received_at
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut message =
            CanonicalMessage::from_payload(&envelope.topic, Value::String(timestamp), normalized);
        if message.topic == topics::ENM_01 {
            message = flatten_generator_message(message);
        }

        if let Err(e) = validate_message(&message, &self.validation) {
            warn!(topic = %message.topic, error = %e, "invalid packet dropped");
            return;
        }

        self.fan_out(&message).await;

        if let Some(device_id) = message.device_id.clone() {
            let result = self
                .tracker
                .touch(&message.topic, &device_id, Utc::now().timestamp())
                .await;
            if let Err(e) = result {
                warn!(topic = %message.topic, error = %e, "liveness touch failed");
            }
        }

        self.metrics
            .last_message_epoch_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        debug!(topic = %message.topic, device_id = ?message.device_id, "mqtt message processed");
    }

    /// Submit persist + broadcast on the capped pool with a shared deadline.
    async fn fan_out(&self, message: &CanonicalMessage) {
        let mut persist_task = {
            let sink = self.sink.clone();
            let semaphore = self.fanout_semaphore.clone();
            let message = message.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                sink.persist(message).await
            })
        };
        let mut broadcast_task = {
            let bus = self.bus.clone();
            let semaphore = self.fanout_semaphore.clone();
            let group = self.telemetry_group.clone();
            let body = serde_json::to_value(message).unwrap_or(Value::Null);
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                bus.publish(&group, BusEvent::new(TELEMETRY_MESSAGE, body)).await;
                Ok::<(), String>(())
            })
        };

        let joined = tokio::time::timeout(
            self.fanout_timeout,
            futures::future::join(&mut persist_task, &mut broadcast_task),
        )
        .await;

        match joined {
            Ok((persist, broadcast)) => {
                for result in [persist, broadcast] {
                    self.record_fanout_result(result);
                }
            }
            Err(_) => {
                let pending = self.settle_late(persist_task).await + self.settle_late(broadcast_task).await;
                if pending > 0 {
                    self.metrics
                        .fanout_errors
                        .fetch_add(pending, Ordering::Relaxed);
                    warn!(pending, "fanout timeout");
                }
            }
        }
    }

    fn record_fanout_result(&self, result: Result<Result<(), String>, tokio::task::JoinError>) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics.fanout_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "fanout error");
            }
            Err(e) => {
                self.metrics.fanout_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "fanout task panicked");
            }
        }
    }

    /// Account a fan-out task that ran past the deadline. Finished tasks are
    /// settled normally; unfinished ones count as errors and keep running
    /// detached.
    async fn settle_late(&self, mut task: JoinHandle<Result<(), String>>) -> u64 {
        if task.is_finished() {
            self.record_fanout_result((&mut task).await);
            0
        } else {
            1
        }
    }
}

/// Decode raw MQTT payload bytes.
///
/// UTF-8 JSON parses to a value; UTF-8 non-JSON is kept as text with
/// newlines collapsed to spaces; non-UTF-8 is kept as a hex string.
pub fn decode_payload(raw: Vec<u8>) -> Value {
    match String::from_utf8(raw) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(_) => Value::String(text.lines().collect::<Vec<_>>().join(" ")),
        },
        Err(e) => Value::String(hex::encode(e.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    use gridpulse_bus::LocalBus;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<CanonicalMessage>>,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn persist(&self, message: CanonicalMessage) -> Result<(), String> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTracker {
        touches: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DeviceTracker for RecordingTracker {
        async fn touch(&self, topic: &str, device_id: &str, _now: i64) -> Result<(), String> {
            self.touches
                .lock()
                .unwrap()
                .push((topic.to_string(), device_id.to_string()));
            Ok(())
        }
    }

    struct Harness {
        worker: IngestWorker,
        sink: Arc<RecordingSink>,
        tracker: Arc<RecordingTracker>,
        bus: Arc<LocalBus>,
    }

    fn harness(buffer_ttl_secs: u64) -> Harness {
        let ingest = IngestConfig {
            queue_capacity: 100,
            drop_on_full: true,
            buffer_ttl_secs,
            fanout_workers: 4,
            fanout_timeout_ms: 1000,
            shutdown_grace_secs: 1,
        };
        let sink = Arc::new(RecordingSink::default());
        let tracker = Arc::new(RecordingTracker::default());
        let bus = Arc::new(LocalBus::new());
        let worker = IngestWorker::new(
            &ingest,
            ValidationConfig::default(),
            "telemetry".to_string(),
            sink.clone(),
            bus.clone(),
            tracker.clone(),
            Arc::new(IngestMetrics::default()),
        );
        Harness {
            worker,
            sink,
            tracker,
            bus,
        }
    }

    fn envelope(topic: &str, body: &str) -> MessageEnvelope {
        MessageEnvelope {
            topic: topic.to_string(),
            qos: 0,
            retained: false,
            payload: body.as_bytes().to_vec(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_single_shot_message_persists_and_broadcasts() {
        let mut h = harness(300);
        let mut rx = h.bus.subscribe("telemetry");
        h.worker
            .handle_envelope(envelope(
                "MQTT_RT_DATA",
                r#"{"id":"dev1","Ua":1.0,"ub":2.0,"time":"t1","isend":"1"}"#,
            ))
            .await;

        let stored = h.sink.messages.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].device_id.as_deref(), Some("dev1"));
        assert_eq!(stored[0].payload["ua"], 1.0);
        drop(stored);

        let body = rx.recv().await.unwrap();
        let event: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(event["type"], "telemetry.message");
        assert_eq!(event["message"]["device_id"], "dev1");
        assert_eq!(event["message"]["payload"]["ua"], 1.0);

        let touches = h.tracker.touches.lock().unwrap();
        assert_eq!(*touches, vec![("MQTT_RT_DATA".to_string(), "dev1".to_string())]);
    }

    #[tokio::test]
    async fn test_fragments_fan_out_once_with_union() {
        let mut h = harness(300);
        h.worker
            .handle_envelope(envelope("MQTT_RT_DATA", r#"{"time":"t2","isend":"0","ua":1.0}"#))
            .await;
        assert!(h.sink.messages.lock().unwrap().is_empty());

        h.worker
            .handle_envelope(envelope("MQTT_RT_DATA", r#"{"time":"t2","isend":"1","ub":2.0}"#))
            .await;
        let stored = h.sink.messages.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload["ua"], 1.0);
        assert_eq!(stored[0].payload["ub"], 2.0);
    }

    #[tokio::test]
    async fn test_stale_buffer_not_carried_into_late_terminator() {
        let mut h = harness(0); // expire immediately
        h.worker
            .handle_envelope(envelope("MQTT_RT_DATA", r#"{"time":"t3","isend":"0","ua":1.0}"#))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.worker
            .handle_envelope(envelope("MQTT_RT_DATA", r#"{"time":"t3","isend":"1","ub":2.0}"#))
            .await;

        let stored = h.sink.messages.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].payload.get("ua").is_none());
        assert_eq!(stored[0].payload["ub"], 2.0);
    }

    #[tokio::test]
    async fn test_generator_message_is_flattened() {
        let mut h = harness(300);
        h.worker
            .handle_envelope(envelope(
                "CCCL/PURBACHAL/ENM_01",
                r#"{"id":"gen1","data":[{"tp":1700000000000,"point":[{"id":"e1","val":5}]}]}"#,
            ))
            .await;
        let stored = h.sink.messages.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload["timestamp"], 1_700_000_000_000i64);
        assert_eq!(stored[0].payload["e1"], 5);
    }

    #[tokio::test]
    async fn test_non_json_payload_dropped_at_validation() {
        let mut h = harness(300);
        h.worker
            .handle_envelope(envelope("MQTT_RT_DATA", "plain\ntext"))
            .await;
        assert!(h.sink.messages.lock().unwrap().is_empty());
        assert!(h.tracker.touches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_decode_payload_variants() {
        assert_eq!(decode_payload(b"{\"a\":1}".to_vec()), json!({"a": 1}));
        assert_eq!(
            decode_payload(b"line one\nline two".to_vec()),
            json!("line one line two")
        );
        assert_eq!(decode_payload(vec![0xff, 0xfe]), json!("fffe"));
    }
}
