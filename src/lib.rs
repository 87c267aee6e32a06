//! # mapsync
//!
//! A kernel map replication agent: eBPF-observed mutations of a BPF hash
//! map on one host are pushed to a peer host, which applies them to its own
//! map. Two agents pointed at each other keep the map converged in both
//! directions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            mapsync-agent                             │
//! │                                                                      │
//! │  kernel                      userspace                               │
//! │  ┌────────────┐   ring buf   ┌────────┐   TCP (per event)            │
//! │  │ fentry on  │─────────────►│ Sender │──────────────────► peer      │
//! │  │ htab_map_* │              └────────┘                              │
//! │  └────────────┘                                                      │
//! │        ▲ suppresses self-pid ┌──────────┐                            │
//! │  ┌────────────┐   identity   │ Receiver │◄───────────────── peer     │
//! │  │ map_config │◄─────────────┤ (apply)  │                            │
//! │  └────────────┘              └────┬─────┘                            │
//! │  ┌────────────┐                   │ upsert/delete                    │
//! │  │ hash_map   │◄──────────────────┘                                  │
//! │  └────────────┘                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Anti-Echo
//!
//! Inbound applies are themselves kernel map mutations and would be
//! observed and re-replicated. Before the instrumentation attaches, the
//! agent registers its pid in the `map_config` slot; the BPF side emits no
//! event for mutations triggered by that pid. See [`registry`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mapsync::{Agent, AgentConfig, ChannelSource, InMemoryRegistry, NoOpGateway};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (_events, source) = ChannelSource::with_capacity(64);
//!     let mut agent = Agent::new(
//!         AgentConfig::default(),
//!         NoOpGateway,
//!         InMemoryRegistry::new(),
//!         source,
//!     );
//!     agent.start().await.expect("Failed to start");
//!
//!     // Agent runs until shutdown signal
//!     agent.shutdown().await;
//! }
//! ```

pub mod agent;
pub mod bpf;
pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod metrics;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod wire;

// Re-exports for convenience
pub use agent::{Agent, AgentState, HealthCheck};
pub use config::{AgentConfig, BpfConfig, NodeConfig, PeerConfig};
pub use error::{AgentError, Result};
pub use event::{EventOrigin, MutationEvent, MutationKind};
pub use gateway::{KernelMapGateway, MapGateway, NoOpGateway};
pub use receiver::Receiver;
pub use registry::{BpfIdentityRegistry, HostIdentity, IdentityRegistry, InMemoryRegistry};
pub use sender::{ChannelSource, EventSource, PeerClient, Sender};
pub use wire::ReplicationRequest;
