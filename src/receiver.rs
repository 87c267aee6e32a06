// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication receiver: the inbound half of the peer protocol.
//!
//! Accepts TCP connections from peer senders and applies each well-formed
//! `SetValue` frame to the local kernel map through the
//! [`MapGateway`](crate::gateway::MapGateway). A connection carries any
//! number of frames until EOF, so per-event dialers and pooled senders hit
//! the same loop.
//!
//! # Serialization
//!
//! Every inbound apply takes one exclusive lock around the gateway, so at
//! most one mutation touches the map handle at a time regardless of how many
//! connections are active. Frame parsing happens outside the lock into a
//! request-scoped value; the lock covers only the gateway call and is
//! released on every path including gateway failure.
//!
//! # Acknowledgment
//!
//! `SetValue` is always acked [`STATUS_OK`](crate::wire::STATUS_OK) once the
//! gateway call returns: map-engine errors are logged and counted but never
//! propagated across the wire. An unknown `kind` inside a well-formed frame
//! is a no-op, also acked OK. `GetValue` is declared in the protocol surface
//! but implemented by no agent variant; it acks
//! [`STATUS_UNIMPLEMENTED`](crate::wire::STATUS_UNIMPLEMENTED).
//!
//! The receiver never dials out while handling a request: replication is
//! strictly request/apply, never chained.

use crate::event::MutationKind;
use crate::gateway::MapGateway;
use crate::metrics;
use crate::wire::{self, ReplicationRequest, Request, STATUS_OK, STATUS_UNIMPLEMENTED};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// The inbound replication service.
pub struct Receiver<G: MapGateway> {
    gateway: Arc<Mutex<G>>,
}

impl<G: MapGateway> Receiver<G> {
    /// Create a receiver applying through the given gateway.
    ///
    /// The `Arc<Mutex<_>>` is shared with nothing else in practice; it is
    /// the serialization point for all inbound applies.
    pub fn new(gateway: Arc<Mutex<G>>) -> Self {
        Self { gateway }
    }

    /// Serve connections on `listener` until shutdown is signaled.
    ///
    /// Each connection gets its own task. A protocol violation closes only
    /// the offending connection; the accept loop keeps serving.
    pub async fn serve(self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Replication receiver serving");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            metrics::record_connection_accepted();
                            debug!(%peer_addr, "Accepted replication connection");
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                handle_connection(gateway, stream, peer_addr.to_string()).await;
                            });
                        }
                        Err(e) => {
                            // Transient accept failures (EMFILE, resets) do
                            // not stop the service.
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Replication receiver stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Process frames from one connection until EOF or a protocol violation.
async fn handle_connection<G: MapGateway>(
    gateway: Arc<Mutex<G>>,
    mut stream: TcpStream,
    peer_addr: String,
) {
    loop {
        let request = match wire::read_request(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(%peer_addr, "Peer closed replication connection");
                return;
            }
            Err(e) => {
                // No reply can be framed for garbage; drop the connection.
                warn!(%peer_addr, error = %e, "Wire protocol violation, closing connection");
                metrics::record_wire_violation();
                return;
            }
        };

        let status = match request {
            Request::SetValue(req) => {
                apply(&gateway, &req).await;
                STATUS_OK
            }
            Request::GetValue => {
                debug!(%peer_addr, "GetValue requested (unimplemented)");
                STATUS_UNIMPLEMENTED
            }
        };

        if let Err(e) = wire::write_status(&mut stream, status).await {
            warn!(%peer_addr, error = %e, "Failed to write ack, closing connection");
            return;
        }
    }
}

/// Dispatch one request to the gateway under the apply lock.
///
/// Gateway failures are swallowed here by design: the caller acks OK either
/// way, and the failure is visible in logs and metrics only.
async fn apply<G: MapGateway>(gateway: &Mutex<G>, request: &ReplicationRequest) {
    let Some(kind) = request.mutation_kind() else {
        warn!(
            kind = request.kind,
            key = request.key,
            map_id = request.map_id,
            "Unknown mutation kind, ignoring"
        );
        metrics::record_apply_skipped();
        return;
    };

    info!("Applying replicated mutation: {request}");

    let result = {
        let mut gateway = gateway.lock().await;
        match kind {
            MutationKind::Update => gateway.upsert(request.key, request.value),
            MutationKind::Delete => gateway.delete(request.key),
        }
    };

    match result {
        Ok(()) => metrics::record_apply(&kind.to_string()),
        Err(e) => {
            error!(
                %kind,
                key = request.key,
                error = %e,
                "Local map apply failed (acking OK regardless)"
            );
            metrics::record_apply_failure(&kind.to_string());
        }
    }
}
