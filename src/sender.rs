// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication sender: the main ingestion loop.
//!
//! Pulls kernel mutation records from an [`EventSource`], decodes each one,
//! and pushes a `SetValue` frame to the configured peer. Delivery is
//! at-most-once and best-effort: every per-event failure (unreplicable
//! origin, rejected narrowing, unreachable peer, timeout, bad ack) is logged
//! and the loop moves to the next event. Only the event source itself
//! failing is fatal; there is no recovery path for a broken kernel event
//! channel.
//!
//! # Connection Model
//!
//! The sender dials the peer per event: connect, one frame, one ack, under
//! a single deadline. This keeps the failure domain per-event at the cost of
//! transport-level ordering guarantees; since the loop awaits each ack (or
//! its timeout) before the next dial, order is preserved in practice except
//! when an abandoned call lands late at the peer.
//!
//! # Backpressure
//!
//! None. A slow or down peer means events are dropped at the rate they
//! arrive; the kernel-side producer is never blocked by this loop.

use crate::error::{AgentError, Result};
use crate::event::{MutationEvent, MutationKind};
use crate::metrics;
use crate::wire::{self, ReplicationRequest, Request, STATUS_OK};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of raw kernel mutation records.
///
/// `next_record` resolves when a record is available. An `Err` means the
/// channel itself broke and the ingestion loop must terminate.
pub trait EventSource: Send + 'static {
    fn next_record(&mut self) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// Event source over a tokio mpsc channel.
///
/// Used by tests and embeddings that produce records in-process; the
/// production source is the ring buffer in [`crate::bpf`].
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// A source plus the sending half that feeds it.
    pub fn with_capacity(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

impl EventSource for ChannelSource {
    fn next_record(&mut self) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            self.rx
                .recv()
                .await
                .ok_or_else(|| AgentError::EventChannel("event channel closed".to_string()))
        })
    }
}

/// Client for the outbound half of the peer protocol.
///
/// Dials per call; holds no connection state.
#[derive(Debug, Clone)]
pub struct PeerClient {
    addr: String,
    rpc_timeout: Duration,
}

impl PeerClient {
    pub fn new(addr: impl Into<String>, rpc_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            rpc_timeout,
        }
    }

    /// Peer address this client dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Deliver one replicated mutation: connect, one frame, read the ack.
    ///
    /// The whole call runs under the configured deadline; on expiry it is
    /// abandoned locally (the peer may still complete the apply).
    pub async fn send(&self, request: &ReplicationRequest) -> Result<()> {
        let call = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            wire::write_request(&mut stream, &Request::SetValue(*request)).await?;
            let status = wire::read_status(&mut stream).await?;
            if status == STATUS_OK {
                Ok(())
            } else {
                Err(std::io::Error::other(format!(
                    "peer acked status {status:#04x}"
                )))
            }
        };

        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AgentError::peer(&self.addr, e)),
            Err(_) => Err(AgentError::peer(&self.addr, "deadline exceeded")),
        }
    }
}

/// The ingestion loop: event source in, replication calls out.
pub struct Sender<S: EventSource> {
    source: S,
    client: PeerClient,
}

impl<S: EventSource> Sender<S> {
    pub fn new(source: S, client: PeerClient) -> Self {
        Self { source, client }
    }

    /// Run until the source fails or shutdown is signaled.
    ///
    /// Returns `Ok(())` on orderly shutdown and `Err` only for the fatal
    /// case: the event source breaking.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!(peer = %self.client.addr(), "Replication sender running");
        loop {
            tokio::select! {
                record = self.source.next_record() => {
                    let record = record?;
                    self.process(&record).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Replication sender stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Decode one record and replicate it if eligible.
    ///
    /// Every failure path here is per-event: drop, log, count, return.
    async fn process(&mut self, record: &[u8]) {
        let event = MutationEvent::decode(record);
        let map_name = event.map_name();
        info!(
            map_id = event.map_id,
            map_name = %map_name,
            origin = event.origin_raw,
            pid = event.pid,
            key_size = event.key_size,
            value_size = event.value_size,
            key = ?event.key_bytes(),
            value = ?event.value_bytes(),
            "Observed map mutation"
        );
        metrics::record_event_decoded(&map_name);

        let Some(kind) = self.classify(&event) else {
            return;
        };

        let key = match event.key_as_i32() {
            Ok(key) => key,
            Err(e) => {
                warn!(map_id = event.map_id, error = %e, "Dropping event: {e}");
                metrics::record_event_dropped("key_width");
                return;
            }
        };
        // Delete records carry no value; the wire carries zero.
        let value = match kind {
            MutationKind::Update => match event.value_as_i32() {
                Ok(value) => value,
                Err(e) => {
                    warn!(map_id = event.map_id, error = %e, "Dropping event: {e}");
                    metrics::record_event_dropped("value_width");
                    return;
                }
            },
            MutationKind::Delete => 0,
        };

        let request = ReplicationRequest::new(key, value, kind, event.map_id as i32);
        let started = Instant::now();
        match self.client.send(&request).await {
            Ok(()) => {
                info!(peer = %self.client.addr(), "Replicated mutation: {request}");
                metrics::record_replication_sent(self.client.addr());
                metrics::record_replication_latency(self.client.addr(), started.elapsed());
            }
            Err(e) => {
                // At-most-once: this mutation is lost for the peer.
                warn!(peer = %self.client.addr(), error = %e, "Replication failed, continuing");
                metrics::record_replication_failure(self.client.addr(), "send");
            }
        }
    }

    /// Map the event's origin to a wire kind, or drop.
    fn classify(&self, event: &MutationEvent) -> Option<MutationKind> {
        let Some(origin) = event.origin() else {
            warn!(
                origin = event.origin_raw,
                map_id = event.map_id,
                "Dropping event with unrecognized origin"
            );
            metrics::record_event_dropped("origin_unknown");
            return None;
        };
        match origin.replication_kind() {
            Some(kind) => Some(kind),
            None => {
                // Reads and unclassified triggers; normal, not an error.
                debug!(%origin, map_id = event.map_id, "Origin not replicable, dropping");
                metrics::record_event_dropped("not_replicable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_delivers_in_order() {
        let (tx, mut source) = ChannelSource::with_capacity(4);
        tx.send(vec![1]).await.unwrap();
        tx.send(vec![2]).await.unwrap();

        assert_eq!(source.next_record().await.unwrap(), vec![1]);
        assert_eq!(source.next_record().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_channel_source_closed_is_fatal() {
        let (tx, mut source) = ChannelSource::with_capacity(1);
        drop(tx);

        let err = source.next_record().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_peer_client_connect_refused_is_nonfatal() {
        // Port 1 is essentially never listening.
        let client = PeerClient::new("127.0.0.1:1", Duration::from_millis(250));
        let request = ReplicationRequest::new(1, 2, MutationKind::Update, 0);

        let err = client.send(&request).await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_peer_client_timeout_is_nonfatal() {
        // A listener that accepts but never acks forces the deadline path.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = PeerClient::new(addr.to_string(), Duration::from_millis(100));
        let request = ReplicationRequest::new(1, 2, MutationKind::Update, 0);

        let err = client.send(&request).await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn test_sender_shutdown_returns_ok() {
        let (_tx, source) = ChannelSource::with_capacity(1);
        let client = PeerClient::new("127.0.0.1:1", Duration::from_millis(100));
        let sender = Sender::new(source, client);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sender.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_sender_source_failure_is_fatal() {
        let (tx, source) = ChannelSource::with_capacity(1);
        let client = PeerClient::new("127.0.0.1:1", Duration::from_millis(100));
        let sender = Sender::new(source, client);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sender.run(shutdown_rx));

        drop(tx);
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_fatal());
    }
}
