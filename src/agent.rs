// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Agent lifecycle.
//!
//! The [`Agent`] ties the halves together:
//! - Inbound: a [`Receiver`](crate::receiver::Receiver) applying peer
//!   mutations through the [`MapGateway`](crate::gateway::MapGateway)
//! - Outbound: a [`Sender`](crate::sender::Sender) pushing locally observed
//!   mutations to the configured peer
//! - Identity: one write into the
//!   [`IdentityRegistry`](crate::registry::IdentityRegistry) before the
//!   instrumentation attaches
//!
//! # Start Ordering
//!
//! `start()` runs a fixed sequence and the order is load-bearing:
//!
//! 1. Bind the inbound listener (resolves port 0 to a real port)
//! 2. Register the host identity with the bound port
//! 3. Attach the kernel instrumentation
//! 4. Spawn the receiver and sender tasks
//!
//! Registration before attachment closes the echo window: once the fentry
//! programs are live, every local apply is observed, and without the
//! identity in place those applies would be replicated back to the peer
//! that sent them.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (tasks spawned)
//!    ↓                              ↓
//! Stopped ←──── ShuttingDown ←── Running
//!                shutdown()         │
//!                                   │ (ingestion loop broke)
//!                                   ↓
//!                                Failed
//! ```

use crate::bpf::Instrumentation;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::gateway::MapGateway;
use crate::metrics;
use crate::receiver::Receiver;
use crate::registry::{HostIdentity, IdentityRegistry};
use crate::sender::{EventSource, PeerClient, Sender};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// State of the agent.
///
/// See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Agent created but not started.
    Created,

    /// `start()` in progress: binding, registering, attaching.
    Starting,

    /// Both halves running.
    Running,

    /// `shutdown()` called; tasks are draining.
    ShuttingDown,

    /// Shut down cleanly. Safe to drop.
    Stopped,

    /// The ingestion loop broke (source failure or a corrupt record) or
    /// startup failed. No recovery; the process should exit and restart.
    Failed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Created => write!(f, "Created"),
            AgentState::Starting => write!(f, "Starting"),
            AgentState::Running => write!(f, "Running"),
            AgentState::ShuttingDown => write!(f, "ShuttingDown"),
            AgentState::Stopped => write!(f, "Stopped"),
            AgentState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health snapshot for monitoring endpoints.
///
/// Collected from cached internal state; no network IO.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Current lifecycle state.
    pub state: AgentState,
    /// True only in `Running`.
    pub ready: bool,
    /// The bound inbound address, once `start()` has run.
    pub listen_addr: Option<SocketAddr>,
    /// The configured peer address.
    pub peer_addr: String,
}

/// The map replication agent.
///
/// Generic over its three seams so tests can run the full lifecycle without
/// a kernel: the map gateway, the identity registry, and the event source.
/// The production binary wires all three to the loaded BPF object.
pub struct Agent<G: MapGateway, R: IdentityRegistry, S: EventSource> {
    config: AgentConfig,

    /// Apply serialization point, shared with the receiver.
    gateway: Arc<Mutex<G>>,

    registry: R,

    /// Taken by `start()`; present only before the sender task spawns.
    source: Option<S>,

    /// The loaded BPF object, if this agent runs with real instrumentation.
    instrumentation: Option<Instrumentation>,

    state_tx: watch::Sender<AgentState>,
    state_rx: watch::Receiver<AgentState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Receiver and sender task handles, drained on shutdown.
    handles: Vec<tokio::task::JoinHandle<()>>,

    /// Resolved inbound address after bind.
    bound_addr: Option<SocketAddr>,
}

impl<G: MapGateway, R: IdentityRegistry, S: EventSource> Agent<G, R, S> {
    /// Create an agent in `Created` state. Call [`start()`](Self::start) to
    /// bind, register, attach, and spawn the replication tasks.
    pub fn new(config: AgentConfig, gateway: G, registry: R, source: S) -> Self {
        let (state_tx, state_rx) = watch::channel(AgentState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            gateway: Arc::new(Mutex::new(gateway)),
            registry,
            source: Some(source),
            instrumentation: None,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
            bound_addr: None,
        }
    }

    /// Attach real kernel instrumentation during `start()`.
    ///
    /// Without this the agent runs userspace-only: the receiver still
    /// applies through the gateway and the sender still drains the source.
    pub fn with_instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// Watch state changes (used by the binary to detect `Failed`).
    pub fn state_receiver(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }

    /// Check if the agent is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), AgentState::Running)
    }

    /// The inbound address after `start()` resolved it.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Health snapshot for monitoring.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        HealthCheck {
            state,
            ready: state == AgentState::Running,
            listen_addr: self.bound_addr,
            peer_addr: self.config.peer.addr.clone(),
        }
    }

    /// Start the agent.
    ///
    /// Any failure here leaves the agent in `Failed`: a partially started
    /// agent (bound but unregistered, registered but unattached) must not
    /// be retried in place.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != AgentState::Created {
            return Err(AgentError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        self.set_state(AgentState::Starting);

        match self.start_inner().await {
            Ok(()) => {
                self.set_state(AgentState::Running);
                info!(
                    listen_addr = ?self.bound_addr,
                    peer = %self.config.peer.addr,
                    "Agent running"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Agent startup failed");
                self.set_state(AgentState::Failed);
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<()> {
        self.config.validate()?;

        // Bind first so port 0 resolves before the identity is written.
        let listen_addr = self.config.node.listen_socket_addr()?;
        let listener = TcpListener::bind(listen_addr).await?;
        let bound = listener.local_addr()?;
        self.bound_addr = Some(bound);
        info!(%bound, "Inbound replication listener bound");

        // Identity before attach: once the programs are live, local applies
        // are observed, and unsuppressed ones would echo to the peer.
        self.registry
            .register(HostIdentity::for_current_process(bound.port()))?;

        if let Some(instrumentation) = self.instrumentation.as_mut() {
            instrumentation.attach()?;
        } else {
            debug!("No instrumentation; running userspace-only");
        }

        // Inbound half.
        let receiver = Receiver::new(Arc::clone(&self.gateway));
        let receiver_shutdown = self.shutdown_rx.clone();
        self.handles.push(tokio::spawn(async move {
            receiver.serve(listener, receiver_shutdown).await;
        }));

        // Outbound half. A fatal sender error (the event source breaking)
        // flips the agent to Failed; the binary watches for that.
        let source = self
            .source
            .take()
            .ok_or_else(|| AgentError::Internal("event source already taken".to_string()))?;
        let client = PeerClient::new(
            self.config.peer.addr.clone(),
            self.config.peer.rpc_timeout_duration(),
        );
        let sender = Sender::new(source, client);
        let sender_shutdown = self.shutdown_rx.clone();
        let state_tx = self.state_tx.clone();
        let sender_task = tokio::spawn(sender.run(sender_shutdown));
        self.handles.push(tokio::spawn(async move {
            let failure = match sender_task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                // A panic in the ingestion loop (a corrupt record tripping
                // the decoder's integrity check) is as fatal as an error
                // return; without this the loop would die silently while
                // the receiver keeps serving.
                Err(e) if e.is_panic() => Some(format!("ingestion loop panicked: {e}")),
                Err(_) => None,
            };
            if let Some(reason) = failure {
                error!(error = %reason, "Replication sender failed");
                let _ = state_tx.send(AgentState::Failed);
                metrics::set_agent_state("Failed");
            }
        }));

        Ok(())
    }

    /// Shutdown the agent gracefully.
    ///
    /// Signals both tasks and waits for each with a drain timeout. Safe to
    /// call from any state, including after a sender failure.
    pub async fn shutdown(&mut self) {
        info!("Shutting down agent");
        self.set_state(AgentState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let drain_timeout = std::time::Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        self.set_state(AgentState::Stopped);
        info!("Agent stopped");
    }

    fn set_state(&self, state: AgentState) {
        let _ = self.state_tx.send(state);
        metrics::set_agent_state(&state.to_string());
    }
}
