//! Configuration for the map replication agent.
//!
//! This module defines all configuration types needed to run the agent.
//! Configuration is passed to [`Agent::new()`](crate::agent::Agent::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use mapsync::config::AgentConfig;
//!
//! let config = AgentConfig {
//!     peer: mapsync::config::PeerConfig {
//!         addr: "10.0.0.2:50051".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! AgentConfig
//! ├── node: NodeConfig   # where this agent listens for inbound replication
//! ├── peer: PeerConfig   # the one peer mutations are pushed to
//! └── bpf: BpfConfig     # the instrumentation object to load
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "node": { "listen_addr": "0.0.0.0:50051" },
//!   "peer": { "addr": "10.0.0.2:50051", "rpc_timeout": "1s" },
//!   "bpf": { "object_path": "/usr/lib/mapsync/sync.bpf.o" }
//! }
//! ```

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from the binary to Agent::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Agent::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Inbound replication endpoint settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// The peer that observed mutations are pushed to.
    #[serde(default)]
    pub peer: PeerConfig,

    /// Kernel instrumentation settings.
    #[serde(default)]
    pub bpf: BpfConfig,
}

impl AgentConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("reading {}: {e}", path.display())))?;
        let config: AgentConfig = serde_json::from_str(&data)
            .map_err(|e| AgentError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config for values that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        self.node.listen_socket_addr()?;
        if self.peer.addr.is_empty() {
            return Err(AgentError::Config("peer.addr is empty".to_string()));
        }
        if !self.peer.addr.contains(':') {
            return Err(AgentError::Config(format!(
                "peer.addr {:?} has no port",
                self.peer.addr
            )));
        }
        if humantime::parse_duration(&self.peer.rpc_timeout).is_err() {
            return Err(AgentError::Config(format!(
                "peer.rpc_timeout {:?} is not a duration",
                self.peer.rpc_timeout
            )));
        }
        if self.bpf.object_path.is_empty() {
            return Err(AgentError::Config("bpf.object_path is empty".to_string()));
        }
        Ok(())
    }

    /// Create a config for testing: ephemeral listen port, fast timeout.
    ///
    /// The peer address points at a closed port; tests that exercise
    /// delivery override it with a real listener's address.
    pub fn for_testing() -> Self {
        Self {
            node: NodeConfig {
                listen_addr: "127.0.0.1:0".to_string(),
            },
            peer: PeerConfig {
                addr: "127.0.0.1:1".to_string(),
                rpc_timeout: "250ms".to_string(),
            },
            bpf: BpfConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: the inbound replication endpoint
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for this agent's inbound replication endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the replication receiver binds to.
    ///
    /// Port 0 binds an ephemeral port; the bound port is what gets
    /// registered in the host identity slot.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:50051".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl NodeConfig {
    /// Parse the listen address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            AgentError::Config(format!(
                "node.listen_addr {:?} is not a socket address: {e}",
                self.listen_addr
            ))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerConfig: the one peer mutations replicate to
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the replication peer.
///
/// Exactly one peer: fan-out is not part of this design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer agent address (`host:port`). Hostnames are resolved at dial
    /// time; the connection is re-established per event.
    #[serde(default = "default_peer_addr")]
    pub addr: String,

    /// Deadline for one replication call (connect, send, ack) as a
    /// duration string (e.g., "1s"). Parsed to Duration internally.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: String,
}

fn default_peer_addr() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_rpc_timeout() -> String {
    "1s".to_string()
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            addr: default_peer_addr(),
            rpc_timeout: default_rpc_timeout(),
        }
    }
}

impl PeerConfig {
    /// Parse the rpc_timeout string to a Duration.
    pub fn rpc_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.rpc_timeout).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BpfConfig: the instrumentation object
// ═══════════════════════════════════════════════════════════════════════════════

/// Kernel instrumentation settings.
///
/// The BPF object is an external build artifact; the agent loads and
/// attaches it but does not build it. The `MAPSYNC_BPF_OBJECT` environment
/// variable overrides `object_path` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpfConfig {
    /// Path to the prebuilt BPF object file.
    #[serde(default = "default_object_path")]
    pub object_path: String,
}

fn default_object_path() -> String {
    "/usr/lib/mapsync/sync.bpf.o".to_string()
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            object_path: default_object_path(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
