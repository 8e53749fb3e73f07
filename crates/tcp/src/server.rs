//! Heartbeat-driven TCP server for solar gateways.
//!
//! Each connection runs on one task so responses commit in request order.
//! The request cycle is process-wide state shared across all connections.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use gridpulse_bus::{BusEvent, GroupBus, TCP_MESSAGE};
use gridpulse_core::config::TcpConfig;
use gridpulse_core::topics;
use gridpulse_liveness::LivenessIndex;
use gridpulse_store::{SolarBatchHandle, SolarDocument};

use crate::error::TcpError;
use crate::metrics::TcpMetrics;
use crate::protocol::{decode_response, DecodeError, ResponseCycle, HEARTBEAT_PACKET};

/// Commit seam for a completed three-phase readout; tests inject their own.
#[async_trait]
pub trait SolarCommitter: Send + Sync + 'static {
    async fn commit(&self, document: SolarDocument);
}

/// Production commit path: batched store write, realtime broadcast,
/// liveness touch.
pub struct SolarPipeline {
    writer: SolarBatchHandle,
    bus: Arc<dyn GroupBus>,
    liveness: Option<LivenessIndex>,
    group: String,
}

impl SolarPipeline {
    pub fn new(
        writer: SolarBatchHandle,
        bus: Arc<dyn GroupBus>,
        liveness: Option<LivenessIndex>,
        group: String,
    ) -> Self {
        Self {
            writer,
            bus,
            liveness,
            group,
        }
    }
}

#[async_trait]
impl SolarCommitter for SolarPipeline {
    async fn commit(&self, document: SolarDocument) {
        // A full queue drops the readout entirely; the broadcast follows the
        // stored document, not the other way round.
        if !self.writer.enqueue(document.clone()) {
            return;
        }
        let message = serde_json::json!({
            "device_id": document.client_id,
            "topic": topics::TCP_SOLAR,
            "timestamp": document.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            "payload": {
                "current": document.current,
                "power": document.power,
                "energy_consumption": document.energy_consumption,
            },
        });
        self.bus
            .publish(&self.group, BusEvent::new(TCP_MESSAGE, message))
            .await;

        if let Some(liveness) = &self.liveness {
            let result = liveness
                .touch(topics::TCP_SOLAR, &document.client_id, Utc::now().timestamp())
                .await;
            if let Err(e) = result {
                warn!(client_id = %document.client_id, error = %e, "liveness touch failed");
            }
        }
    }
}

pub struct TcpTelemetryServer {
    config: TcpConfig,
    cycle: Arc<ResponseCycle>,
    committer: Arc<dyn SolarCommitter>,
    metrics: Arc<TcpMetrics>,
}

impl TcpTelemetryServer {
    pub fn new(
        config: TcpConfig,
        committer: Arc<dyn SolarCommitter>,
        metrics: Arc<TcpMetrics>,
    ) -> Self {
        Self {
            config,
            cycle: Arc::new(ResponseCycle::new()),
            committer,
            metrics,
        }
    }

    /// Accept connections until the stop signal; active connections finish
    /// on their own timeouts.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<(), TcpError> {
        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse::<std::net::SocketAddr>()
            .map_err(|e| TcpError::Config(format!("bad TCP_HOST/TCP_PORT: {e}")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(self.config.backlog)?;
        info!(addr = %addr, "tcp server listening");

        let clients = Arc::new(Semaphore::new(self.config.max_clients.max(1)));
        loop {
            let permit = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() { break; }
                    continue;
                }
                permit = clients.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() { break; }
                    continue;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let client_id = format!("{}:{}", peer.ip(), peer.port());
            info!(client_id = %client_id, "new connection");
            let cycle = self.cycle.clone();
            let committer = self.committer.clone();
            let metrics = self.metrics.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handle_connection(stream, client_id, &config, cycle, committer, metrics).await;
            });
        }
        info!("tcp server stopped accepting");
        Ok(())
    }
}

/// Per-connection heartbeat/response state machine.
pub(crate) async fn handle_connection<S>(
    mut stream: S,
    client_id: String,
    config: &TcpConfig,
    cycle: Arc<ResponseCycle>,
    committer: Arc<dyn SolarCommitter>,
    metrics: Arc<TcpMetrics>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    metrics.connections_total.fetch_add(1, Ordering::Relaxed);
    metrics.active_connections.fetch_add(1, Ordering::Relaxed);

    let read_timeout = Duration::from_secs(config.client_timeout_secs);
    let mut buf = vec![0u8; config.recv_buffer.max(16)];
    let mut accumulated: HashMap<usize, Vec<f64>> = HashMap::new();
    let mut timeout_retries: u32 = 0;

    loop {
        let n = match tokio::time::timeout(read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                info!(client_id = %client_id, "client disconnected");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!(client_id = %client_id, error = %e, "connection lost");
                break;
            }
            Err(_) => {
                warn!(client_id = %client_id, "connection timeout");
                metrics.timeouts_total.fetch_add(1, Ordering::Relaxed);
                break;
            }
        };
        timeout_retries = 0;

        if &buf[..n] != HEARTBEAT_PACKET {
            warn!(client_id = %client_id, bytes = n, "unrecognized packet");
            continue;
        }

        let (index, packet) = cycle.next();
        debug!(client_id = %client_id, index, "sending request");
        if let Err(e) = stream.write_all(packet).await {
            warn!(client_id = %client_id, error = %e, "write failed");
            break;
        }

        match tokio::time::timeout(read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                warn!(client_id = %client_id, "client disconnected after request");
                break;
            }
            Ok(Ok(n)) => {
                if n < 6 {
                    warn!(client_id = %client_id, bytes = n, "short response");
                    metrics.parse_errors_total.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let hex_response = hex::encode_upper(&buf[..n]);
                debug!(client_id = %client_id, response = %hex_response, "response received");
                match decode_response(index, &hex_response) {
                    Ok(values) if !values.is_empty() => {
                        accumulated.insert(index, values);
                        if accumulated.len() == 3 {
                            let document = assemble_document(&client_id, &mut accumulated);
                            committer.commit(document).await;
                        }
                    }
                    Ok(_) => {}
                    Err(DecodeError::NoMarker) => {
                        debug!(client_id = %client_id, "response without function marker");
                    }
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "response decode failed");
                        metrics.parse_errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(client_id = %client_id, error = %e, "connection lost awaiting response");
                break;
            }
            Err(_) => {
                warn!(client_id = %client_id, "timeout waiting for response");
                metrics.timeouts_total.fetch_add(1, Ordering::Relaxed);
                timeout_retries += 1;
                if timeout_retries >= config.timeout_max_retries {
                    warn!(client_id = %client_id, "max timeouts reached; closing");
                    break;
                }
                let delay = (config.timeout_backoff_base_secs
                    * 2f64.powi(timeout_retries as i32 - 1))
                .min(config.timeout_backoff_max_secs);
                tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
            }
        }
    }

    metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
}

/// Build the committed document from a full accumulator and clear it.
fn assemble_document(client_id: &str, accumulated: &mut HashMap<usize, Vec<f64>>) -> SolarDocument {
    let document = SolarDocument {
        timestamp: Utc::now(),
        client_id: client_id.to_string(),
        current: accumulated.remove(&0).unwrap_or_default(),
        power: accumulated.remove(&1).unwrap_or_default(),
        energy_consumption: accumulated.remove(&2).unwrap_or_default(),
    };
    accumulated.clear();
    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCommitter {
        documents: Mutex<Vec<SolarDocument>>,
    }

    #[async_trait]
    impl SolarCommitter for RecordingCommitter {
        async fn commit(&self, document: SolarDocument) {
            self.documents.lock().unwrap().push(document);
        }
    }

    fn test_config() -> TcpConfig {
        TcpConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            recv_buffer: 1024,
            client_timeout_secs: 5,
            backlog: 50,
            max_clients: 100,
            queue_size: 100,
            batch_size: 10,
            batch_flush_ms: 100,
            timeout_max_retries: 3,
            timeout_backoff_base_secs: 0.01,
            timeout_backoff_max_secs: 0.02,
        }
    }

    fn float_reply(values: &[f32]) -> Vec<u8> {
        let mut bytes = vec![0x01, 0x03, (values.len() * 4) as u8];
        for v in values {
            bytes.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        bytes
    }

    fn int_reply(values: &[i64]) -> Vec<u8> {
        let mut bytes = vec![0x01, 0x03, (values.len() * 8) as u8];
        for v in values {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes
    }

    fn spawn_handler(
        server: tokio::io::DuplexStream,
        committer: Arc<RecordingCommitter>,
        metrics: Arc<TcpMetrics>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let config = test_config();
            handle_connection(
                server,
                "10.0.0.9:4242".to_string(),
                &config,
                Arc::new(ResponseCycle::new()),
                committer,
                metrics,
            )
            .await;
        })
    }

    #[tokio::test]
    async fn test_three_phase_commit() {
        let committer = Arc::new(RecordingCommitter::default());
        let metrics = Arc::new(TcpMetrics::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let handler = spawn_handler(server, committer.clone(), metrics.clone());

        let replies: [Vec<u8>; 3] = [
            float_reply(&[1.0, 2.0]),
            float_reply(&[1.0, 2.0]),
            int_reply(&[10, 20]),
        ];
        let mut buf = [0u8; 64];
        for reply in &replies {
            client.write_all(HEARTBEAT_PACKET).await.unwrap();
            let n = client.read(&mut buf).await.unwrap();
            assert_eq!(n, 12); // canonical request packet
            client.write_all(reply).await.unwrap();
        }
        // Close the connection so the handler returns.
        drop(client);
        handler.await.unwrap();

        let documents = committer.documents.lock().unwrap();
        assert_eq!(documents.len(), 1);
        let doc = &documents[0];
        assert_eq!(doc.client_id, "10.0.0.9:4242");
        assert_eq!(doc.current, vec![1.0, 2.0]);
        assert_eq!(doc.power, vec![1.0, 2.0]);
        assert_eq!(doc.energy_consumption, vec![10.0, 20.0]);
        assert_eq!(metrics.connections_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_misaligned_response_counts_parse_error() {
        let committer = Arc::new(RecordingCommitter::default());
        let metrics = Arc::new(TcpMetrics::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let handler = spawn_handler(server, committer.clone(), metrics.clone());

        client.write_all(HEARTBEAT_PACKET).await.unwrap();
        let mut buf = [0u8; 64];
        client.read(&mut buf).await.unwrap();
        // 0103, length, then 3 bytes: not a whole float32.
        client
            .write_all(&[0x01, 0x03, 0x03, 0xAA, 0xBB, 0xCC])
            .await
            .unwrap();
        drop(client);
        handler.await.unwrap();

        assert!(committer.documents.lock().unwrap().is_empty());
        assert_eq!(metrics.parse_errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_non_heartbeat_bytes_do_not_break_connection() {
        let committer = Arc::new(RecordingCommitter::default());
        let metrics = Arc::new(TcpMetrics::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let handler = spawn_handler(server, committer.clone(), metrics.clone());

        client.write_all(b"GARBAGE").await.unwrap();
        // Let the handler consume the garbage before the real heartbeat so
        // the two writes cannot coalesce into one read.
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The connection is still alive: a heartbeat gets a request packet.
        client.write_all(HEARTBEAT_PACKET).await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], crate::protocol::RESPONSE_PACKETS[0]);
        drop(client);
        handler.await.unwrap();
    }

    #[test]
    fn test_assemble_document_clears_accumulator() {
        let mut accumulated = HashMap::from([
            (0, vec![1.0]),
            (1, vec![2.0]),
            (2, vec![3.0]),
        ]);
        let doc = assemble_document("c", &mut accumulated);
        assert_eq!(doc.current, vec![1.0]);
        assert_eq!(doc.power, vec![2.0]);
        assert_eq!(doc.energy_consumption, vec![3.0]);
        assert!(accumulated.is_empty());
    }
}
