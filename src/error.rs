// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the map replication agent.
//!
//! This module defines the error types used throughout the agent. Errors are
//! categorized by their source (kernel instrumentation boundary, peer wire
//! protocol, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Fatal | Description |
//! |------------|-------|-------------|
//! | `Bpf` | Yes | BPF object load, program attach, map extraction failed |
//! | `Identity` | Yes | Host identity registration failed or repeated |
//! | `EventChannel` | Yes | Kernel event ring buffer broke |
//! | `Config` | Yes | Configuration invalid |
//! | `Io` | Yes | Listener bind or other foundational IO failed |
//! | `InvalidState` | Yes | Agent lifecycle violation |
//! | `Internal` | Yes | Unexpected internal error |
//! | `Peer` | No | One outbound replication call failed |
//! | `Wire` | No | One inbound connection sent a malformed frame |
//! | `Shutdown` | No | Agent is shutting down (orderly, not a defect) |
//!
//! # Fatality
//!
//! Use [`AgentError::is_fatal()`] to decide whether the agent process must
//! terminate. Per-event and per-connection failures are never fatal: the
//! ingestion loop logs them and moves on. Failures of the foundational
//! channels (event ring, identity registration, instrumentation attach)
//! leave the agent with nothing useful to do and must exit.

use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while replicating kernel map mutations.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_fatal()`](Self::is_fatal) to check whether the agent
/// can continue running.
#[derive(Error, Debug)]
pub enum AgentError {
    /// BPF boundary failure.
    ///
    /// Occurs while loading the BPF object, attaching its programs, or
    /// extracting its maps. Fatal: without the instrumentation there is
    /// no event stream to replicate.
    #[error("BPF error ({operation}): {message}")]
    Bpf { operation: String, message: String },

    /// Host identity registration failure.
    ///
    /// Occurs when the identity slot cannot be written, or when a second
    /// registration is attempted. Fatal: without a registered identity the
    /// kernel side cannot suppress self-originated events and replication
    /// would loop between peers.
    #[error("Identity registration error: {0}")]
    Identity(String),

    /// Kernel event channel failure.
    ///
    /// Occurs when the ring buffer read path breaks. Fatal: there is no
    /// recovery path for a broken kernel event channel.
    #[error("Event channel error: {0}")]
    EventChannel(String),

    /// Invalid or missing configuration.
    ///
    /// Occurs during startup if config is malformed.
    /// Fatal: fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound replication call failure.
    ///
    /// Occurs when the peer is unreachable, the call times out, or the ack
    /// is not OK. Never fatal: the mutation is lost for this peer and the
    /// ingestion loop continues (at-most-once delivery, no retry).
    #[error("Peer error ({addr}): {message}")]
    Peer { addr: String, message: String },

    /// Inbound wire protocol violation.
    ///
    /// Occurs when a connection sends a malformed frame or unknown opcode.
    /// Never fatal: the offending connection is closed and the listener
    /// keeps serving.
    #[error("Wire protocol error: {0}")]
    Wire(String),

    /// Agent lifecycle violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running agent).
    /// Indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// Returned when operations are attempted during shutdown.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Foundational IO failure (listener bind, object file read).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create a BPF boundary error with operation context.
    pub fn bpf(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Bpf {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Create a peer error with the peer address for context.
    pub fn peer(addr: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Peer {
            addr: addr.into(),
            message: err.to_string(),
        }
    }

    /// Check if this error must terminate the agent.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Bpf { .. } => true,
            Self::Identity(_) => true,
            Self::EventChannel(_) => true,
            Self::Config(_) => true,
            Self::Io(_) => true,
            Self::InvalidState { .. } => true,
            Self::Internal(_) => true,
            Self::Peer { .. } => false, // mutation lost, loop continues
            Self::Wire(_) => false,     // connection closed, listener continues
            Self::Shutdown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_bpf() {
        let err = AgentError::bpf("attach htab_map_update_elem", "program not found");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("attach htab_map_update_elem"));
    }

    #[test]
    fn test_fatal_identity() {
        let err = AgentError::Identity("already registered".to_string());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_event_channel() {
        let err = AgentError::EventChannel("ring buffer closed".to_string());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_config() {
        let err = AgentError::Config("invalid peer address".to_string());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_fatal_peer() {
        let err = AgentError::peer("10.0.0.2:50051", "connection refused");
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("10.0.0.2:50051"));
    }

    #[test]
    fn test_not_fatal_wire() {
        let err = AgentError::Wire("unknown opcode 0x7f".to_string());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_not_fatal_shutdown() {
        let err = AgentError::Shutdown;
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_invalid_state() {
        let err = AgentError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err: AgentError = io.into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_peer_error_formatting() {
        let err = AgentError::Peer {
            addr: "127.0.0.1:50051".to_string(),
            message: "deadline exceeded".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Peer error"));
        assert!(msg.contains("127.0.0.1:50051"));
        assert!(msg.contains("deadline exceeded"));
    }
}
