//! Integration tests for the Node public API.
//!
//! These tests exercise the public interface exposed through the Node facade,
//! validating that all public methods work correctly in realistic scenarios.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use argus_relay::{
    BindError, BootstrapPeer, DialError, Node, NodeConfig, PeerEvent, StreamFilter,
    TransportConfig,
};
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(30000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

/// Helper to allocate unique ports for test nodes
fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_secs(2);

async fn wait_for_peer(node: &Node, peer: &Node) {
    timeout(TEST_TIMEOUT, async {
        while !node.connected_peers().await.contains(&peer.peer_identity()) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("peer never connected");
}

#[tokio::test]
async fn node_bind_and_identity() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");

    // Identity should be 64 hex characters (32 bytes)
    let identity = node.identity();
    assert_eq!(identity.len(), 64, "identity should be 64 hex chars");
    assert!(
        identity.chars().all(|c| c.is_ascii_hexdigit()),
        "identity should be hex"
    );
    assert_eq!(node.peer_identity().to_hex(), identity);
    assert_eq!(node.keypair().identity(), node.peer_identity());

    assert!(node.local_addr().port() > 0, "port should be positive");
    assert_eq!(node.routable_addresses(), vec![node.local_addr().to_string()]);
}

#[tokio::test]
async fn node_bind_rejects_bad_address() {
    assert!(Node::bind("not-an-address").await.is_err());
}

#[tokio::test]
async fn bind_conflict_is_a_bind_error() {
    let addr = test_addr();
    let _first = Node::bind(&addr).await.expect("first bind failed");

    let err = match Node::bind(&addr).await {
        Ok(_) => panic!("second bind on {} should fail", addr),
        Err(e) => e,
    };
    let bind = err
        .downcast_ref::<BindError>()
        .expect("error should be a BindError");
    assert_eq!(bind.attempted.len(), 1);
}

#[tokio::test]
async fn node_starts_with_directory_running() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");

    assert!(node.directory().is_started().await);
    let subscriptions = node.pubsub().subscriptions().await;
    assert_eq!(subscriptions, vec!["argus-defense/stream-directory".to_string()]);
}

#[tokio::test]
async fn custom_namespace_changes_topics() {
    let config = NodeConfig::default()
        .with_namespace("drill")
        .with_listen_addr(test_addr().parse().unwrap());
    let node = Node::start(config).await.expect("start failed");

    assert_eq!(
        node.pubsub().subscriptions().await,
        vec!["drill/stream-directory".to_string()]
    );
}

#[tokio::test]
async fn two_node_connect() {
    let node1 = Node::bind(&test_addr()).await.expect("node1 bind failed");
    let node2 = Node::bind(&test_addr()).await.expect("node2 bind failed");

    let mut events1 = node1.overlay().events().await.expect("events already taken");
    assert!(node1.overlay().events().await.is_none());

    let result = timeout(
        TEST_TIMEOUT,
        node2.connect(&node1.identity(), &node1.local_addr().to_string()),
    )
    .await;
    assert!(result.is_ok(), "connect should complete within timeout");
    result.unwrap().expect("connect should succeed");

    assert!(node2.connected_peers().await.contains(&node1.peer_identity()));
    wait_for_peer(&node1, &node2).await;

    let event = timeout(TEST_TIMEOUT, events1.recv())
        .await
        .expect("no peer event")
        .expect("event channel closed");
    match event {
        PeerEvent::Connected { peer, .. } => assert_eq!(peer, node2.peer_identity()),
        other => panic!("expected Connected, got {:?}", other),
    }
}

#[tokio::test]
async fn bootstrap_peers_are_dialed_on_start() {
    let seed = Node::bind(&test_addr()).await.expect("seed bind failed");

    let bootstrap: BootstrapPeer = format!("{}/{}", seed.local_addr(), seed.identity())
        .parse()
        .expect("bootstrap peer should parse");
    let config = NodeConfig {
        transport: TransportConfig {
            listen_addrs: vec![test_addr().parse().unwrap()],
            bootstrap: vec![bootstrap],
            ..Default::default()
        },
        ..Default::default()
    };
    let node = Node::start(config).await.expect("start failed");

    wait_for_peer(&node, &seed).await;
    wait_for_peer(&seed, &node).await;
}

#[tokio::test]
async fn peer_exchange_introduces_third_node() {
    let seed = Node::bind(&test_addr()).await.expect("seed bind failed");
    let node_b = Node::bind(&test_addr()).await.expect("node_b bind failed");
    let node_c = Node::bind(&test_addr()).await.expect("node_c bind failed");

    node_b
        .connect(&seed.identity(), &seed.local_addr().to_string())
        .await
        .unwrap();
    wait_for_peer(&seed, &node_b).await;

    // C only knows the seed; the seed's Hello reply names B
    node_c
        .connect(&seed.identity(), &seed.local_addr().to_string())
        .await
        .unwrap();
    wait_for_peer(&node_c, &node_b).await;
}

#[tokio::test]
async fn invalid_identity_rejected() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");

    // Invalid identity (too short)
    let result = node.connect("abc", "127.0.0.1:9999").await;
    assert!(result.is_err(), "should reject short identity");

    // Invalid identity (not hex)
    let result = node
        .connect(
            "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz",
            "127.0.0.1:9999",
        )
        .await;
    assert!(result.is_err(), "should reject non-hex identity");

    // Own identity
    let result = node.connect(&node.identity(), &node.local_addr().to_string()).await;
    assert!(result.is_err(), "should refuse to dial self");
}

#[tokio::test]
async fn unreachable_peer_is_a_dial_error() {
    let config = NodeConfig {
        transport: TransportConfig {
            listen_addrs: vec![test_addr().parse().unwrap()],
            dial_timeout: Duration::from_millis(300),
            ..Default::default()
        },
        ..Default::default()
    };
    let node = Node::start(config).await.expect("start failed");

    let fake_id = "0000000000000000000000000000000000000000000000000000000000000001";
    let result = timeout(SHORT_TIMEOUT, node.connect(fake_id, &test_addr()))
        .await
        .expect("dial should give up within its timeout");

    let err = result.expect_err("nobody listens there");
    assert!(err.downcast_ref::<DialError>().is_some(), "got {:#}", err);
    assert!(node.connected_peers().await.is_empty());
}

#[tokio::test]
async fn node_info_summarizes_state() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");

    let info = node.info().await;
    assert_eq!(info.identity, node.identity());
    assert_eq!(info.addresses, vec![node.local_addr().to_string()]);
    assert!(info.connected_peers.is_empty());
    assert_eq!(info.streams.total, 0);
    assert!(info.active_streams.is_empty());
    assert!(info.subscriptions.is_empty());
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");

    node.shutdown().await;
    node.shutdown().await;

    assert!(node.connected_peers().await.is_empty());
    assert!(
        node.directory()
            .discovered_streams(StreamFilter::default())
            .await
            .is_empty()
    );
}
