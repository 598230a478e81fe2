//! Integration tests for the stream directory across real nodes.
//!
//! Covers announcement propagation, deregistration, query/response for
//! late joiners, heartbeat liveness and stale eviction.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use argus_relay::{
    DirectoryConfig, DirectoryEvent, Node, NodeConfig, RemovalReason, StreamFilter,
    StreamMetadata, directory_topic, DEFAULT_NAMESPACE,
};
use tokio::time::timeout;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Helper Functions
// =============================================================================

async fn node_with_directory(directory: DirectoryConfig) -> Node {
    let config = NodeConfig {
        directory,
        ..Default::default()
    }
    .with_listen_addr(test_addr().parse().unwrap());
    Node::start(config).await.expect("node start failed")
}

/// Connect `a` and `b` and wait until each sees the other on the directory topic.
async fn link(a: &Node, b: &Node) {
    b.connect(&a.identity(), &a.local_addr().to_string())
        .await
        .expect("connect failed");
    let topic = directory_topic(DEFAULT_NAMESPACE);
    timeout(TEST_TIMEOUT, async {
        loop {
            let a_sees_b = a.pubsub().subscribers(&topic).await.contains(&b.peer_identity());
            let b_sees_a = b.pubsub().subscribers(&topic).await.contains(&a.peer_identity());
            if a_sees_b && b_sees_a {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("directory subscriptions never propagated");
}

async fn wait_for_streams(node: &Node, filter: StreamFilter, count: usize) -> Vec<argus_relay::DirectoryEntry> {
    timeout(TEST_TIMEOUT, async {
        loop {
            let streams = node.directory().discovered_streams(filter.clone()).await;
            if streams.len() == count {
                return streams;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("directory never reached expected size")
}

fn metadata(name: &str, system: &str, category: &str) -> StreamMetadata {
    StreamMetadata {
        name: Some(name.to_string()),
        system_name: Some(system.to_string()),
        category: Some(category.to_string()),
        ..Default::default()
    }
}

// =============================================================================
// Test: announce propagates
// =============================================================================

#[tokio::test]
async fn announcement_reaches_connected_node() {
    let node_a = Node::bind(&test_addr()).await.unwrap();
    let node_b = Node::bind(&test_addr()).await.unwrap();
    let mut events_b = node_b.directory().events().await.unwrap();
    link(&node_a, &node_b).await;

    node_a
        .directory()
        .announce_stream("fire-1", metadata("Fire Dispatch", "county", "fire"))
        .await
        .unwrap();

    let streams = wait_for_streams(&node_b, StreamFilter::default(), 1).await;
    let entry = &streams[0];
    assert_eq!(entry.stream_id, "fire-1");
    assert_eq!(entry.publisher, node_a.peer_identity());
    assert!(!entry.is_local);
    assert_eq!(entry.metadata.name.as_deref(), Some("Fire Dispatch"));
    assert_eq!(entry.metadata.topic.as_deref(), Some("argus-defense/stream/fire-1"));
    assert_eq!(
        entry.metadata.publisher_addrs,
        Some(vec![node_a.local_addr().to_string()])
    );

    match timeout(TEST_TIMEOUT, events_b.recv()).await.unwrap().unwrap() {
        DirectoryEvent::Discovered(e) => assert_eq!(e.stream_id, "fire-1"),
        other => panic!("expected Discovered, got {:?}", other),
    }

    // Self-delivery is off by default
    assert!(
        node_a
            .directory()
            .discovered_streams(StreamFilter::default())
            .await
            .is_empty()
    );
    let count = node_a.directory().stream_count().await;
    assert_eq!((count.local, count.discovered, count.total), (1, 0, 1));
}

#[tokio::test]
async fn filters_apply_to_discovered_streams() {
    let node_a = Node::bind(&test_addr()).await.unwrap();
    let node_b = Node::bind(&test_addr()).await.unwrap();
    link(&node_a, &node_b).await;

    let dir = node_a.directory();
    dir.announce_stream("a", metadata("A", "X", "fire")).await.unwrap();
    dir.announce_stream("b", metadata("B", "Y", "fire")).await.unwrap();
    dir.announce_stream("c", metadata("C", "X", "police")).await.unwrap();

    wait_for_streams(&node_b, StreamFilter::default(), 3).await;

    let by_system = node_b.directory().discovered_streams(StreamFilter::by_system("X")).await;
    let mut ids: Vec<_> = by_system.iter().map(|e| e.stream_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "c"]);

    let fire_in_x = StreamFilter {
        system: Some("X".into()),
        category: Some("fire".into()),
        ..Default::default()
    };
    let streams = node_b.directory().discovered_streams(fire_in_x).await;
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].stream_id, "a");

    let by_stranger = StreamFilter {
        publisher: Some(node_b.identity()),
        ..Default::default()
    };
    assert!(node_b.directory().discovered_streams(by_stranger).await.is_empty());
}

// =============================================================================
// Test: deregister
// =============================================================================

#[tokio::test]
async fn deregister_removes_stream_everywhere() {
    let node_a = Node::bind(&test_addr()).await.unwrap();
    let node_b = Node::bind(&test_addr()).await.unwrap();
    let mut events_b = node_b.directory().events().await.unwrap();
    link(&node_a, &node_b).await;

    node_a
        .directory()
        .announce_stream("s1", StreamMetadata::named("one"))
        .await
        .unwrap();
    wait_for_streams(&node_b, StreamFilter::default(), 1).await;

    node_a.directory().deregister_stream("s1").await.unwrap();
    // Repeating is harmless
    node_a.directory().deregister_stream("s1").await.unwrap();

    wait_for_streams(&node_b, StreamFilter::default(), 0).await;
    assert!(node_a.directory().local_streams().await.is_empty());

    let mut saw_removal = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(500), events_b.recv()).await {
        if let DirectoryEvent::Removed { stream_id, reason } = event {
            assert_eq!(stream_id, "s1");
            assert_eq!(reason, RemovalReason::Deregistered);
            saw_removal = true;
            break;
        }
    }
    assert!(saw_removal, "expected a Removed event");
}

#[tokio::test]
async fn stopping_directory_deregisters_local_streams() {
    let node_a = Node::bind(&test_addr()).await.unwrap();
    let node_b = Node::bind(&test_addr()).await.unwrap();
    link(&node_a, &node_b).await;

    node_a
        .directory()
        .announce_stream("s1", StreamMetadata::default())
        .await
        .unwrap();
    wait_for_streams(&node_b, StreamFilter::default(), 1).await;

    node_a.directory().stop().await;
    assert_eq!(node_a.directory().stream_count().await.total, 0);
    wait_for_streams(&node_b, StreamFilter::default(), 0).await;
}

// =============================================================================
// Test: query / response
// =============================================================================

#[tokio::test]
async fn late_joiner_learns_streams_by_query() {
    let node_a = Node::bind(&test_addr()).await.unwrap();
    node_a
        .directory()
        .announce_stream("early", metadata("Early", "X", "fire"))
        .await
        .unwrap();
    node_a
        .directory()
        .announce_stream("other", metadata("Other", "Y", "fire"))
        .await
        .unwrap();

    let node_b = Node::bind(&test_addr()).await.unwrap();
    link(&node_a, &node_b).await;
    assert!(
        node_b
            .directory()
            .discovered_streams(StreamFilter::default())
            .await
            .is_empty()
    );

    let known = node_b
        .directory()
        .query_streams(StreamFilter::by_system("X"))
        .await
        .unwrap();
    assert!(known.is_empty(), "query returns what is already known");

    let streams = wait_for_streams(&node_b, StreamFilter::default(), 1).await;
    assert_eq!(streams[0].stream_id, "early");
    assert_eq!(streams[0].publisher, node_a.peer_identity());
}

#[tokio::test]
async fn query_without_matches_gets_no_answer() {
    let node_a = Node::bind(&test_addr()).await.unwrap();
    node_a
        .directory()
        .announce_stream("s1", metadata("S", "X", "fire"))
        .await
        .unwrap();

    let node_b = Node::bind(&test_addr()).await.unwrap();
    link(&node_a, &node_b).await;

    node_b
        .directory()
        .query_streams(StreamFilter::by_system("nope"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        node_b
            .directory()
            .discovered_streams(StreamFilter::default())
            .await
            .is_empty()
    );
}

// =============================================================================
// Test: liveness
// =============================================================================

#[tokio::test]
async fn silent_publisher_goes_stale() {
    let node_a = node_with_directory(DirectoryConfig {
        heartbeat_interval: Duration::from_secs(60),
        ..Default::default()
    })
    .await;
    let node_b = node_with_directory(DirectoryConfig {
        cleanup_interval: Duration::from_millis(100),
        stale_threshold: Duration::from_millis(300),
        ..Default::default()
    })
    .await;
    let mut events_b = node_b.directory().events().await.unwrap();
    link(&node_a, &node_b).await;

    node_a
        .directory()
        .announce_stream("quiet", StreamMetadata::default())
        .await
        .unwrap();
    wait_for_streams(&node_b, StreamFilter::default(), 1).await;
    wait_for_streams(&node_b, StreamFilter::default(), 0).await;

    let removal = timeout(TEST_TIMEOUT, async {
        loop {
            match events_b.recv().await {
                Some(DirectoryEvent::Removed { reason, .. }) => return reason,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(removal, RemovalReason::Stale);

    // The publisher's own entry is never aged
    assert_eq!(node_a.directory().local_streams().await.len(), 1);
}

#[tokio::test]
async fn heartbeats_keep_stream_alive() {
    let node_a = node_with_directory(DirectoryConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..Default::default()
    })
    .await;
    let node_b = node_with_directory(DirectoryConfig {
        cleanup_interval: Duration::from_millis(100),
        stale_threshold: Duration::from_millis(600),
        ..Default::default()
    })
    .await;
    link(&node_a, &node_b).await;

    node_a
        .directory()
        .announce_stream("live", StreamMetadata::default())
        .await
        .unwrap();
    let first = wait_for_streams(&node_b, StreamFilter::default(), 1).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let later = node_b.directory().discovered_streams(StreamFilter::default()).await;
    assert_eq!(later.len(), 1, "heartbeats should keep the stream listed");
    assert!(later[0].last_seen > first[0].last_seen);
}
