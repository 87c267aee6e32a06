// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Map replication agent binary.
//!
//! Loads the BPF object, wires the agent to its maps, and runs until
//! interrupted or failed. Requires CAP_BPF (or root) and a kernel with BTF.

use anyhow::{bail, Context};
use clap::Parser;
use mapsync::agent::{Agent, AgentState};
use mapsync::bpf::{self, Instrumentation};
use mapsync::config::AgentConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mapsync-agent", about = "Replicates kernel map mutations to a peer host")]
struct Args {
    /// Path to a JSON config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Peer address to replicate to (overrides config).
    #[arg(long)]
    peer: Option<String>,

    /// Address to listen on for inbound replication (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Path to the prebuilt BPF object (overrides config).
    #[arg(long)]
    bpf_object: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(peer) = args.peer {
        config.peer.addr = peer;
    }
    if let Some(listen) = args.listen {
        config.node.listen_addr = listen;
    }
    if let Some(object) = args.bpf_object {
        config.bpf.object_path = object;
    }
    config.validate().context("invalid configuration")?;

    bpf::remove_memlock_limit();

    let mut instrumentation =
        Instrumentation::load(&config.bpf).context("loading BPF object")?;
    let source = instrumentation
        .take_event_ring()
        .context("opening event ring buffer")?;
    let registry = instrumentation
        .take_identity_registry()
        .context("opening identity map")?;
    let gateway = instrumentation
        .take_map_gateway()
        .context("opening replicated map")?;

    let mut agent = Agent::new(config, gateway, registry, source)
        .with_instrumentation(instrumentation);
    agent.start().await.context("starting agent")?;

    let mut state_rx = agent.state_receiver();
    let failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
            false
        }
        _ = async {
            // Watch for the sender flipping the agent to Failed.
            while state_rx.changed().await.is_ok() {
                if *state_rx.borrow() == AgentState::Failed {
                    break;
                }
            }
        } => {
            error!("Agent failed, shutting down");
            true
        }
    };

    agent.shutdown().await;

    if failed {
        bail!("agent terminated after a fatal error");
    }
    info!("Agent exited");
    Ok(())
}
