//! End-to-end tests over real loopback sockets.
//!
//! These run the actual sender and receiver halves against each other; only
//! the kernel boundary (gateway, registry, event source) is mocked.

mod common;

use common::mock_gateway::{AppliedCall, MockGateway};
use common::{delete_record, update_record};
use mapsync::agent::{Agent, AgentState};
use mapsync::config::AgentConfig;
use mapsync::error::Result;
use mapsync::gateway::NoOpGateway;
use mapsync::receiver::Receiver;
use mapsync::registry::{HostIdentity, IdentityRegistry};
use mapsync::sender::{ChannelSource, PeerClient, Sender};
use mapsync::wire::{self, ReplicationRequest, Request, STATUS_OK, STATUS_UNIMPLEMENTED};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Spawn a receiver on an ephemeral port, applying into `gateway`.
async fn spawn_receiver(gateway: MockGateway) -> (SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let receiver = Receiver::new(Arc::new(tokio::sync::Mutex::new(gateway)));
    tokio::spawn(receiver.serve(listener, shutdown_rx));
    (addr, shutdown_tx)
}

/// Poll `check` until it passes or two seconds elapse.
async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_update_replicates_end_to_end() {
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let (events, source) = ChannelSource::with_capacity(8);
    let client = PeerClient::new(addr.to_string(), Duration::from_secs(1));
    let (_sender_shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(Sender::new(source, client).run(shutdown_rx));

    events.send(update_record(5, 42)).await.unwrap();

    wait_until(|| gateway.get(5) == Some(42)).await;
}

#[tokio::test]
async fn test_update_then_delete_arrive_in_order() {
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let (events, source) = ChannelSource::with_capacity(8);
    let client = PeerClient::new(addr.to_string(), Duration::from_secs(1));
    let (_sender_shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(Sender::new(source, client).run(shutdown_rx));

    events.send(update_record(5, 42)).await.unwrap();
    events.send(delete_record(5)).await.unwrap();

    wait_until(|| gateway.calls().len() == 2).await;
    assert_eq!(
        gateway.calls(),
        vec![
            AppliedCall::Upsert { key: 5, value: 42 },
            AppliedCall::Delete { key: 5 },
        ]
    );
    assert_eq!(gateway.get(5), None);
}

#[tokio::test]
async fn test_unreplicable_origins_never_reach_the_peer() {
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let (events, source) = ChannelSource::with_capacity(8);
    let client = PeerClient::new(addr.to_string(), Duration::from_secs(1));
    let (_sender_shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(Sender::new(source, client).run(shutdown_rx));

    // A read, an unknown origin, then a real update as the sentinel.
    events
        .send(common::build_record(7, "hash_map", 4, 1, &1i32.to_ne_bytes(), &[]))
        .await
        .unwrap();
    events
        .send(common::build_record(7, "hash_map", 99, 1, &1i32.to_ne_bytes(), &[]))
        .await
        .unwrap();
    events.send(update_record(8, 80)).await.unwrap();

    wait_until(|| gateway.get(8) == Some(80)).await;
    // Only the sentinel update arrived.
    assert_eq!(gateway.calls().len(), 1);
}

#[tokio::test]
async fn test_wide_keys_are_dropped_not_truncated() {
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let (events, source) = ChannelSource::with_capacity(8);
    let client = PeerClient::new(addr.to_string(), Duration::from_secs(1));
    let (_sender_shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(Sender::new(source, client).run(shutdown_rx));

    events
        .send(common::build_record(
            7,
            "hash_map",
            0,
            1,
            &[1; 8],
            &2i32.to_ne_bytes(),
        ))
        .await
        .unwrap();
    events.send(update_record(9, 90)).await.unwrap();

    wait_until(|| gateway.get(9) == Some(90)).await;
    assert_eq!(gateway.calls().len(), 1);
}

#[tokio::test]
async fn test_get_value_acks_unimplemented() {
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    wire::write_request(&mut stream, &Request::GetValue)
        .await
        .unwrap();
    let status = wire::read_status(&mut stream).await.unwrap();
    assert_eq!(status, STATUS_UNIMPLEMENTED);
}

#[tokio::test]
async fn test_unknown_kind_acks_ok_without_touching_the_map() {
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let raw = ReplicationRequest {
        key: 1,
        value: 2,
        kind: 99,
        map_id: 0,
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    wire::write_request(&mut stream, &Request::SetValue(raw))
        .await
        .unwrap();
    let status = wire::read_status(&mut stream).await.unwrap();

    assert_eq!(status, STATUS_OK);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn test_gateway_failure_still_acks_ok() {
    let gateway = MockGateway::new();
    gateway.fail_after(0);
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let req = ReplicationRequest::new(1, 10, mapsync::MutationKind::Update, 0);
    let mut stream = TcpStream::connect(addr).await.unwrap();
    wire::write_request(&mut stream, &Request::SetValue(req))
        .await
        .unwrap();
    let status = wire::read_status(&mut stream).await.unwrap();

    assert_eq!(status, STATUS_OK);
    assert!(gateway.snapshot().is_empty());
}

#[tokio::test]
async fn test_concurrent_connections_all_apply() {
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let mut tasks = Vec::new();
    for key in 0..16 {
        tasks.push(tokio::spawn(async move {
            let req = ReplicationRequest::new(key, key * 10, mapsync::MutationKind::Update, 0);
            let mut stream = TcpStream::connect(addr).await.unwrap();
            wire::write_request(&mut stream, &Request::SetValue(req))
                .await
                .unwrap();
            assert_eq!(wire::read_status(&mut stream).await.unwrap(), STATUS_OK);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let snapshot = gateway.snapshot();
    assert_eq!(snapshot.len(), 16);
    for key in 0..16 {
        assert_eq!(snapshot.get(&key), Some(&(key * 10)));
    }
}

#[tokio::test]
async fn test_one_connection_carries_many_frames() {
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    for key in 0..8 {
        let req = ReplicationRequest::new(key, key, mapsync::MutationKind::Update, 0);
        wire::write_request(&mut stream, &Request::SetValue(req))
            .await
            .unwrap();
        assert_eq!(wire::read_status(&mut stream).await.unwrap(), STATUS_OK);
    }
    drop(stream);

    assert_eq!(gateway.snapshot().len(), 8);
}

#[tokio::test]
async fn test_sender_outlives_unreachable_peer() {
    // Dead peer: bind a listener, learn the port, drop it.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (events, source) = ChannelSource::with_capacity(8);
    let client = PeerClient::new(dead_addr.to_string(), Duration::from_millis(100));
    let (_sender_shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Sender::new(source, client).run(shutdown_rx));

    // Both deliveries fail; the loop must survive them.
    events.send(update_record(1, 1)).await.unwrap();
    events.send(update_record(2, 2)).await.unwrap();
    drop(events);

    // Channel orders guarantee both records were consumed before the close
    // is seen, so the loop survived two failed deliveries.
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap_err().is_fatal());
}

/// Identity registry whose clones share the recorded slot, so tests keep a
/// handle after the agent takes ownership.
#[derive(Debug, Clone, Default)]
struct SharedRegistry {
    slot: Arc<StdMutex<Option<HostIdentity>>>,
}

impl SharedRegistry {
    fn identity(&self) -> Option<HostIdentity> {
        *self.slot.lock().unwrap()
    }
}

impl IdentityRegistry for SharedRegistry {
    fn register(&mut self, identity: HostIdentity) -> Result<()> {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return Err(mapsync::AgentError::Identity(
                "host identity already registered".to_string(),
            ));
        }
        *slot = Some(identity);
        Ok(())
    }
}

#[tokio::test]
async fn test_agent_registers_identity_with_bound_port() {
    let registry = SharedRegistry::default();
    let (_events, source) = ChannelSource::with_capacity(4);
    let mut agent = Agent::new(
        AgentConfig::for_testing(),
        NoOpGateway,
        registry.clone(),
        source,
    );

    agent.start().await.unwrap();
    let bound = agent.bound_addr().unwrap();

    let identity = registry.identity().expect("identity registered");
    assert_eq!(identity.listen_port, bound.port());
    assert_eq!(identity.pid, std::process::id() as u64);

    agent.shutdown().await;
    assert_eq!(agent.state(), AgentState::Stopped);
}

#[tokio::test]
async fn test_two_agents_replicate_to_each_other() {
    // Agent B receives on an ephemeral port; its own peer is irrelevant.
    let gateway_b = MockGateway::new();
    let (_events_b, source_b) = ChannelSource::with_capacity(4);
    let mut agent_b = Agent::new(
        AgentConfig::for_testing(),
        gateway_b.clone(),
        SharedRegistry::default(),
        source_b,
    );
    agent_b.start().await.unwrap();

    // Agent A pushes its observed mutations to B.
    let mut config_a = AgentConfig::for_testing();
    config_a.peer.addr = agent_b.bound_addr().unwrap().to_string();
    config_a.peer.rpc_timeout = "1s".to_string();
    let (events_a, source_a) = ChannelSource::with_capacity(4);
    let mut agent_a = Agent::new(
        config_a,
        MockGateway::new(),
        SharedRegistry::default(),
        source_a,
    );
    agent_a.start().await.unwrap();

    events_a.send(update_record(11, 1100)).await.unwrap();
    wait_until(|| gateway_b.get(11) == Some(1100)).await;

    events_a.send(delete_record(11)).await.unwrap();
    wait_until(|| gateway_b.get(11).is_none()).await;

    agent_a.shutdown().await;
    agent_b.shutdown().await;
}

#[tokio::test]
async fn test_raw_frame_bytes_match_the_documented_layout() {
    // Drive the receiver with hand-built bytes rather than the encoder, so
    // an encoder/decoder drift cannot hide.
    let gateway = MockGateway::new();
    let (addr, _shutdown) = spawn_receiver(gateway.clone()).await;

    let mut frame = vec![0x01u8];
    frame.extend_from_slice(&3i32.to_be_bytes()); // key
    frame.extend_from_slice(&300i32.to_be_bytes()); // value
    frame.extend_from_slice(&0i32.to_be_bytes()); // kind = update
    frame.extend_from_slice(&7i32.to_be_bytes()); // map_id

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&frame).await.unwrap();
    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await.unwrap();

    assert_eq!(status[0], STATUS_OK);
    assert_eq!(gateway.get(3), Some(300));
}
