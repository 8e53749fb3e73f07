//! Broker event loop: subscribe on connect, enqueue publishes, reconnect
//! with exponential backoff.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Packet};
use tokio::sync::watch;
use tracing::{error, info, warn};

use gridpulse_core::config::MqttConfig;

use crate::client::qos_level;
use crate::envelope::{IngestQueue, MessageEnvelope};
use crate::metrics::IngestMetrics;

pub async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    config: MqttConfig,
    queue: IngestQueue,
    metrics: Arc<IngestMetrics>,
    mut stop: watch::Receiver<bool>,
) {
    let qos = qos_level(config.qos);
    let mut backoff = config.reconnect_min_secs.max(1);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!("mqtt event loop stopping");
                    break;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    metrics.connected.store(true, Ordering::Relaxed);
                    backoff = config.reconnect_min_secs.max(1);
                    for topic in &config.topics {
                        if let Err(e) = client.subscribe(topic, qos).await {
                            error!(topic = %topic, error = %e, "subscribe failed");
                        }
                    }
                    info!(topics = config.topics.len(), "connected; subscriptions requested");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let envelope = MessageEnvelope {
                        topic: publish.topic.clone(),
                        qos: publish.qos as u8,
                        retained: publish.retain,
                        payload: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    };
                    queue.enqueue(envelope).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    metrics.connected.store(false, Ordering::Relaxed);
                    warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    metrics.connected.store(false, Ordering::Relaxed);
                    warn!(error = %e, backoff_secs = backoff, "mqtt connection error; retrying");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(config.reconnect_max_secs.max(1));
                }
            }
        }
    }
    metrics.connected.store(false, Ordering::Relaxed);
}
