//! Integration tests for topic pub/sub between real nodes.
//!
//! These tests validate end-to-end message delivery over QUIC: signed
//! messages reach every subscriber exactly once, non-subscribers receive
//! nothing and unsubscribing stops delivery.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use argus_relay::{Identity, Node};
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const MESSAGE_WAIT: Duration = Duration::from_millis(500);

// =============================================================================
// Helper Functions
// =============================================================================

async fn join(node: &Node, seed: &Node) {
    node.connect(&seed.identity(), &seed.local_addr().to_string())
        .await
        .expect("connect failed");
}

/// Poll until `node` knows `peer` subscribes to `topic`.
async fn wait_for_subscriber(node: &Node, topic: &str, peer: Identity) {
    timeout(TEST_TIMEOUT, async {
        loop {
            if node.pubsub().subscribers(topic).await.contains(&peer) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("subscription never propagated");
}

// =============================================================================
// Test: 3 nodes publish/receive
// =============================================================================

/// A message published on A reaches B and C, signed by A.
#[tokio::test]
async fn three_node_pubsub_broadcast() {
    let node_a = Node::bind(&test_addr()).await.expect("node_a bind failed");
    let node_b = Node::bind(&test_addr()).await.expect("node_b bind failed");
    let node_c = Node::bind(&test_addr()).await.expect("node_c bind failed");

    // Build network: B → A, C → A
    join(&node_b, &node_a).await;
    join(&node_c, &node_a).await;

    let topic = "broadcast-test";
    let mut sub_b = node_b.pubsub().subscribe(topic).await.expect("node_b subscribe failed");
    let mut sub_c = node_c.pubsub().subscribe(topic).await.expect("node_c subscribe failed");

    wait_for_subscriber(&node_a, topic, node_b.peer_identity()).await;
    wait_for_subscriber(&node_a, topic, node_c.peer_identity()).await;

    let test_data = b"hello from node A".to_vec();
    node_a
        .pubsub()
        .publish(topic, test_data.clone())
        .await
        .expect("publish failed");

    let msg_b = timeout(TEST_TIMEOUT, sub_b.recv())
        .await
        .expect("node_b receive timeout")
        .expect("node_b channel closed");
    assert_eq!(msg_b.topic, topic);
    assert_eq!(msg_b.source, node_a.peer_identity());
    assert_eq!(msg_b.data, test_data);

    let msg_c = timeout(TEST_TIMEOUT, sub_c.recv())
        .await
        .expect("node_c receive timeout")
        .expect("node_c channel closed");
    assert_eq!(msg_c.source, node_a.peer_identity());
    assert_eq!(msg_c.data, test_data);
    assert_eq!(msg_b.msg_id, msg_c.msg_id);
}

// =============================================================================
// Test: selective delivery and de-duplication
// =============================================================================

/// Only subscribers receive, and each receives a message once even when it
/// is also forwarded by other peers.
#[tokio::test]
async fn subscribers_receive_each_message_once() {
    let node_a = Node::bind(&test_addr()).await.expect("node_a bind failed");
    let node_b = Node::bind(&test_addr()).await.expect("node_b bind failed");
    let node_c = Node::bind(&test_addr()).await.expect("node_c bind failed");
    let node_d = Node::bind(&test_addr()).await.expect("node_d bind failed"); // Not subscribed

    join(&node_b, &node_a).await;
    join(&node_c, &node_a).await;
    join(&node_c, &node_b).await;
    join(&node_d, &node_a).await;

    let topic = "selective-test";
    let mut sub_b = node_b.pubsub().subscribe(topic).await.unwrap();
    let mut sub_c = node_c.pubsub().subscribe(topic).await.unwrap();
    let mut sub_d = node_d.pubsub().subscribe("unrelated-topic").await.unwrap();

    wait_for_subscriber(&node_a, topic, node_b.peer_identity()).await;
    wait_for_subscriber(&node_a, topic, node_c.peer_identity()).await;
    wait_for_subscriber(&node_b, topic, node_c.peer_identity()).await;

    for i in 0..5u8 {
        node_a.pubsub().publish(topic, vec![i; 16]).await.unwrap();
    }

    let mut received_b = Vec::new();
    for _ in 0..5 {
        let msg = timeout(TEST_TIMEOUT, sub_b.recv()).await.unwrap().unwrap();
        received_b.push(msg.data[0]);
    }
    received_b.sort();
    assert_eq!(received_b, vec![0, 1, 2, 3, 4]);

    let mut received_c = Vec::new();
    for _ in 0..5 {
        let msg = timeout(TEST_TIMEOUT, sub_c.recv()).await.unwrap().unwrap();
        received_c.push(msg.data[0]);
    }
    received_c.sort();
    assert_eq!(received_c, vec![0, 1, 2, 3, 4]);

    // No duplicates trail behind
    assert!(timeout(MESSAGE_WAIT, sub_b.recv()).await.is_err());
    assert!(timeout(MESSAGE_WAIT, sub_c.recv()).await.is_err());
    assert!(
        timeout(MESSAGE_WAIT, sub_d.recv()).await.is_err(),
        "node_d should NOT receive message (not subscribed)"
    );
}

// =============================================================================
// Test: unsubscribe
// =============================================================================

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let node_a = Node::bind(&test_addr()).await.expect("node_a bind failed");
    let node_b = Node::bind(&test_addr()).await.expect("node_b bind failed");
    join(&node_b, &node_a).await;

    let topic = "leave-test";
    let mut sub_b = node_b.pubsub().subscribe(topic).await.unwrap();
    wait_for_subscriber(&node_a, topic, node_b.peer_identity()).await;

    node_a.pubsub().publish(topic, b"first".to_vec()).await.unwrap();
    let first = timeout(TEST_TIMEOUT, sub_b.recv()).await.unwrap().unwrap();
    assert_eq!(first.data, b"first");

    node_b.pubsub().unsubscribe(topic).await.unwrap();
    assert!(node_b.pubsub().subscriptions().await.is_empty());

    // The handle is closed by the unsubscribe
    assert!(timeout(TEST_TIMEOUT, sub_b.recv()).await.unwrap().is_none());

    timeout(TEST_TIMEOUT, async {
        while !node_a.pubsub().subscribers(topic).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("unsubscribe never propagated");
}

// =============================================================================
// Test: disconnect prunes subscriptions
// =============================================================================

#[tokio::test]
async fn shutdown_peer_is_forgotten() {
    let node_a = Node::bind(&test_addr()).await.expect("node_a bind failed");
    let node_b = Node::bind(&test_addr()).await.expect("node_b bind failed");
    join(&node_b, &node_a).await;

    let topic = "prune-test";
    let _sub_b = node_b.pubsub().subscribe(topic).await.unwrap();
    wait_for_subscriber(&node_a, topic, node_b.peer_identity()).await;

    node_b.shutdown().await;

    timeout(TEST_TIMEOUT, async {
        loop {
            let gone_from_topic = node_a.pubsub().subscribers(topic).await.is_empty();
            let gone_from_peers = !node_a
                .connected_peers()
                .await
                .contains(&node_b.peer_identity());
            if gone_from_topic && gone_from_peers {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("closed peer was never removed");
}
