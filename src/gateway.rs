//! Local map gateway.
//!
//! Translates a replicated mutation into exactly one call against the local
//! kernel map handle. The gateway is a stateless pass-through: no retries, no
//! batching, no caching of entries. Whatever consistency the kernel map
//! engine guarantees for a single key operation is what the caller gets.
//!
//! The receiver serializes all inbound applies through one gateway behind a
//! `tokio::sync::Mutex`, so the trait takes `&mut self` and implementations
//! do not need their own locking.

use crate::error::{AgentError, Result};
use aya::maps::{HashMap as BpfHashMap, MapData, MapError};
use tracing::debug;

/// One kernel map call per apply.
///
/// Implementations must treat `delete` of an absent key as `Ok`: the kernel
/// reports ENOENT but the replication protocol considers delete idempotent.
pub trait MapGateway: Send + 'static {
    /// Insert or overwrite `(key, value)` in the local map.
    fn upsert(&mut self, key: i32, value: i32) -> Result<()>;

    /// Remove `key` from the local map. Absent keys are not an error.
    fn delete(&mut self, key: i32) -> Result<()>;
}

/// Gateway over the `hash_map` handle in the loaded BPF object.
///
/// The handle is opened once at startup and reused for every apply.
pub struct KernelMapGateway {
    map: BpfHashMap<MapData, i32, i32>,
}

impl KernelMapGateway {
    pub fn new(map: BpfHashMap<MapData, i32, i32>) -> Self {
        Self { map }
    }
}

impl MapGateway for KernelMapGateway {
    fn upsert(&mut self, key: i32, value: i32) -> Result<()> {
        self.map
            .insert(key, value, 0)
            .map_err(|e| AgentError::bpf("hash_map update", e))
    }

    fn delete(&mut self, key: i32) -> Result<()> {
        match self.map.remove(&key) {
            Ok(()) => Ok(()),
            // ENOENT: the key was already gone. Delete is idempotent.
            Err(MapError::SyscallError(ref e))
                if e.io_error.raw_os_error() == Some(libc::ENOENT) =>
            {
                Ok(())
            }
            Err(e) => Err(AgentError::bpf("hash_map delete", e)),
        }
    }
}

/// A gateway that logs applies and discards them.
///
/// Used when running without a kernel map (wiring checks, tests).
#[derive(Debug, Clone, Default)]
pub struct NoOpGateway;

impl MapGateway for NoOpGateway {
    fn upsert(&mut self, key: i32, value: i32) -> Result<()> {
        debug!(key, value, "NoOp: would upsert");
        Ok(())
    }

    fn delete(&mut self, key: i32) -> Result<()> {
        debug!(key, "NoOp: would delete");
        Ok(())
    }
}
