//! Kernel instrumentation boundary.
//!
//! Loads the prebuilt BPF object, attaches its fentry programs to the
//! hashtab mutation paths, and hands out typed handles to its maps:
//!
//! - `map_events`: the ring buffer of mutation records, consumed through
//!   [`RingBufSource`].
//! - `map_config`: the single-slot identity array, wrapped by
//!   [`BpfIdentityRegistry`](crate::registry::BpfIdentityRegistry).
//! - `hash_map`: the replicated map itself, wrapped by
//!   [`KernelMapGateway`](crate::gateway::KernelMapGateway).
//!
//! The BPF programs are an external build artifact; this module never
//! compiles them. The object path comes from config, overridable with the
//! `MAPSYNC_BPF_OBJECT` environment variable.

use crate::config::BpfConfig;
use crate::error::{AgentError, Result};
use crate::gateway::KernelMapGateway;
use crate::registry::BpfIdentityRegistry;
use crate::sender::{BoxFuture, EventSource};
use aya::maps::{Array, HashMap as BpfHashMap, MapData, RingBuf};
use aya::programs::FEntry;
use aya::{Btf, Ebpf, EbpfLoader};
use std::path::PathBuf;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

/// Environment variable overriding the configured BPF object path.
pub const BPF_OBJECT_ENV: &str = "MAPSYNC_BPF_OBJECT";

/// Entry program for in-kernel hashtab updates.
const PROG_UPDATE: &str = "bpf_prog_kern_hmapupdate";
/// Entry program for in-kernel hashtab deletes.
const PROG_DELETE: &str = "bpf_prog_kern_hmapdelete";

/// Kernel functions the programs hook.
const HOOK_UPDATE: &str = "htab_map_update_elem";
const HOOK_DELETE: &str = "htab_map_delete_elem";

/// Remove the memlock rlimit so BPF map allocations succeed.
///
/// Needed on kernels without memcg-based accounting. Failure is logged and
/// ignored: the subsequent load either works or reports the real problem.
pub fn remove_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!(ret, "Removing memlock rlimit failed");
    }
}

/// The loaded BPF object and its attach state.
#[derive(Debug)]
pub struct Instrumentation {
    ebpf: Ebpf,
}

impl Instrumentation {
    /// Load the BPF object from the configured path.
    ///
    /// `MAPSYNC_BPF_OBJECT` wins over `bpf.object_path` when set.
    pub fn load(config: &BpfConfig) -> Result<Self> {
        let path = object_path(config, std::env::var_os(BPF_OBJECT_ENV));
        let data = std::fs::read(&path)
            .map_err(|e| AgentError::bpf("read object", format!("{}: {e}", path.display())))?;
        let ebpf = EbpfLoader::new()
            .load(&data)
            .map_err(|e| AgentError::bpf("load object", format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "Loaded BPF object");
        Ok(Self { ebpf })
    }

    /// Attach both fentry programs.
    ///
    /// Must be called only after the host identity is registered; the agent
    /// start sequence enforces the ordering (the instrumentation starts
    /// observing mutations the moment this returns).
    pub fn attach(&mut self) -> Result<()> {
        let btf = Btf::from_sys_fs().map_err(|e| AgentError::bpf("read BTF", e))?;
        self.attach_fentry(PROG_UPDATE, HOOK_UPDATE, &btf)?;
        self.attach_fentry(PROG_DELETE, HOOK_DELETE, &btf)?;
        Ok(())
    }

    fn attach_fentry(&mut self, prog_name: &str, fn_name: &str, btf: &Btf) -> Result<()> {
        let program: &mut FEntry = self
            .ebpf
            .program_mut(prog_name)
            .ok_or_else(|| {
                AgentError::bpf(format!("find {prog_name}"), "program not in object")
            })?
            .try_into()
            .map_err(|e| AgentError::bpf(format!("cast {prog_name}"), e))?;
        program
            .load(fn_name, btf)
            .map_err(|e| AgentError::bpf(format!("load {prog_name}"), e))?;
        program
            .attach()
            .map_err(|e| AgentError::bpf(format!("attach {prog_name} to {fn_name}"), e))?;
        info!(program = prog_name, hook = fn_name, "Attached fentry program");
        Ok(())
    }

    /// Take the `map_events` ring buffer as an event source.
    pub fn take_event_ring(&mut self) -> Result<RingBufSource> {
        let map = self
            .ebpf
            .take_map("map_events")
            .ok_or_else(|| AgentError::bpf("find map_events", "map not in object"))?;
        let ring =
            RingBuf::try_from(map).map_err(|e| AgentError::bpf("open map_events ring", e))?;
        let ring = AsyncFd::new(ring).map_err(|e| AgentError::bpf("watch map_events fd", e))?;
        Ok(RingBufSource { ring })
    }

    /// Take the `map_config` array as the identity registry.
    pub fn take_identity_registry(&mut self) -> Result<BpfIdentityRegistry> {
        let map = self
            .ebpf
            .take_map("map_config")
            .ok_or_else(|| AgentError::bpf("find map_config", "map not in object"))?;
        let array = Array::try_from(map).map_err(|e| AgentError::bpf("open map_config", e))?;
        Ok(BpfIdentityRegistry::new(array))
    }

    /// Take the `hash_map` handle as the local map gateway.
    ///
    /// Opened once here; the Go-era behavior of reloading the whole object
    /// per inbound request is deliberately not reproduced.
    pub fn take_map_gateway(&mut self) -> Result<KernelMapGateway> {
        let map = self
            .ebpf
            .take_map("hash_map")
            .ok_or_else(|| AgentError::bpf("find hash_map", "map not in object"))?;
        let map = BpfHashMap::try_from(map).map_err(|e| AgentError::bpf("open hash_map", e))?;
        Ok(KernelMapGateway::new(map))
    }
}

fn object_path(config: &BpfConfig, env_override: Option<std::ffi::OsString>) -> PathBuf {
    match env_override {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(&config.object_path),
    }
}

/// Event source over the kernel ring buffer.
///
/// Blocks on fd readiness between records; a wakeup failure is an
/// [`AgentError::EventChannel`] and terminates the ingestion loop.
pub struct RingBufSource {
    ring: AsyncFd<RingBuf<MapData>>,
}

impl EventSource for RingBufSource {
    fn next_record(&mut self) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            loop {
                // Drain before re-arming: the fd is edge-signaled per wakeup,
                // not per record.
                if let Some(record) = self.ring.get_mut().next() {
                    return Ok(record.to_vec());
                }
                let mut guard = self
                    .ring
                    .readable_mut()
                    .await
                    .map_err(|e| AgentError::EventChannel(format!("ring buffer wait: {e}")))?;
                guard.clear_ready();
            }
        })
    }
}
