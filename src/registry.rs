// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host identity registration.
//!
//! At startup the agent writes one [`HostIdentity`] record into slot 0 of the
//! `map_config` array in the loaded BPF object. The BPF side reads it to
//! recognize mutations triggered by this very agent's own apply calls and
//! suppresses the event it would otherwise emit for them.
//!
//! # The Anti-Echo Contract
//!
//! Replication must not loop: when peer B applies a mutation replicated from
//! peer A, B's own instrumentation observes that apply. Without suppression
//! it would emit a new event, B's sender would push it back to A, and the
//! two agents would replay the same mutation forever.
//!
//! The contract between the two halves:
//!
//! - The agent registers `{listen_port, pid}` exactly once, BEFORE the
//!   instrumentation attaches. If attachment came first, mutations applied
//!   during the gap would echo.
//! - The BPF side compares each observed mutation's triggering PID against
//!   the registered `pid` and emits no event on a match.
//!
//! The suppression itself runs in the kernel and cannot be verified from
//! userspace alone. Loop-freedom must be validated end-to-end against the
//! deployed BPF object, not assumed.

use crate::error::{AgentError, Result};
use aya::maps::{Array, MapData};
use tracing::info;

/// This agent's identity as the BPF side reads it.
///
/// Layout is a byte-exact contract with the C reader: `repr(C)` with the
/// padding between `listen_port` and `pid` spelled out as `reserved`, 16
/// bytes total.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIdentity {
    /// Port the replication receiver is bound to.
    pub listen_port: u16,
    /// Explicit padding; always zero.
    pub reserved: [u8; 6],
    /// Process id the BPF side suppresses events for.
    pub pid: u64,
}

// The BPF side reads this struct byte-for-byte out of the array map.
unsafe impl aya::Pod for HostIdentity {}

const _: () = assert!(std::mem::size_of::<HostIdentity>() == 16);
const _: () = assert!(std::mem::align_of::<HostIdentity>() == 8);

impl HostIdentity {
    pub fn new(listen_port: u16, pid: u64) -> Self {
        Self {
            listen_port,
            reserved: [0u8; 6],
            pid,
        }
    }

    /// Identity for the current process.
    pub fn for_current_process(listen_port: u16) -> Self {
        Self::new(listen_port, std::process::id() as u64)
    }
}

/// Write-once sink for the host identity.
///
/// `register` must complete before the instrumentation attaches; the
/// [`Agent`](crate::agent::Agent) start sequence enforces the ordering. A
/// second registration is an error: the identity slot is immutable for the
/// lifetime of the agent.
pub trait IdentityRegistry: Send + 'static {
    fn register(&mut self, identity: HostIdentity) -> Result<()>;
}

/// Registry over the `map_config` array in the loaded BPF object.
///
/// Single slot: the array has one entry and the identity lives at index 0.
pub struct BpfIdentityRegistry {
    map: Array<MapData, HostIdentity>,
    registered: bool,
}

impl BpfIdentityRegistry {
    pub fn new(map: Array<MapData, HostIdentity>) -> Self {
        Self {
            map,
            registered: false,
        }
    }
}

impl IdentityRegistry for BpfIdentityRegistry {
    fn register(&mut self, identity: HostIdentity) -> Result<()> {
        if self.registered {
            return Err(AgentError::Identity(
                "host identity already registered".to_string(),
            ));
        }
        self.map
            .set(0, identity, 0)
            .map_err(|e| AgentError::Identity(format!("writing map_config slot 0: {e}")))?;
        self.registered = true;
        info!(
            listen_port = identity.listen_port,
            pid = identity.pid,
            "Registered host identity for self-origin suppression"
        );
        Ok(())
    }
}

/// In-process registry for running without a BPF object.
///
/// Keeps the write-once contract so lifecycle bugs surface in tests too.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    slot: Option<HostIdentity>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered identity, if any.
    pub fn identity(&self) -> Option<HostIdentity> {
        self.slot
    }
}

impl IdentityRegistry for InMemoryRegistry {
    fn register(&mut self, identity: HostIdentity) -> Result<()> {
        if self.slot.is_some() {
            return Err(AgentError::Identity(
                "host identity already registered".to_string(),
            ));
        }
        self.slot = Some(identity);
        Ok(())
    }
}
