//! End-to-end stream relay between a publishing and a listening node.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use argus_relay::{
    ChunkSource, Node, PublisherEvent, StaticSource, StreamFilter, StreamMetadata,
    StreamSource, SubscriberEvent, stream_topic, DEFAULT_NAMESPACE,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(43000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Emits one block, then stays open until the stream is stopped.
struct OpenEnded {
    first: Option<Bytes>,
}

#[async_trait]
impl ChunkSource for OpenEnded {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        match self.first.take() {
            Some(block) => Ok(Some(block)),
            None => std::future::pending().await,
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Two connected nodes with `listener` already subscribed to `stream_id`.
async fn publisher_and_listener(stream_id: &str) -> (Node, Node, mpsc::Receiver<SubscriberEvent>) {
    let publisher = Node::bind(&test_addr()).await.expect("publisher bind failed");
    let listener = Node::bind(&test_addr()).await.expect("listener bind failed");
    listener
        .connect(&publisher.identity(), &publisher.local_addr().to_string())
        .await
        .expect("connect failed");

    listener
        .subscriber()
        .subscribe_to_stream(stream_id)
        .await
        .expect("subscribe failed");
    let rx = listener.subscriber().listen(stream_id).await.expect("listen failed");

    let topic = stream_topic(DEFAULT_NAMESPACE, stream_id);
    timeout(TEST_TIMEOUT, async {
        while !publisher
            .pubsub()
            .subscribers(&topic)
            .await
            .contains(&listener.peer_identity())
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("listener subscription never reached publisher");

    (publisher, listener, rx)
}

/// Collect events until the stream ends.
async fn drain_until_end(rx: &mut mpsc::Receiver<SubscriberEvent>) -> Vec<SubscriberEvent> {
    timeout(TEST_TIMEOUT, async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, SubscriberEvent::End { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    })
    .await
    .expect("stream never ended")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn recording_is_relayed_and_reassembled() {
    let (publisher, listener, mut rx) = publisher_and_listener("s1").await;

    let published = publisher
        .publisher()
        .publish_stream(
            "s1",
            StreamSource::custom("replay", StaticSource::new([&b"AAA"[..], &b"BBB"[..]])),
            StreamMetadata::named("Fire Dispatch"),
        )
        .await
        .unwrap();
    assert_eq!(published.peer_id, publisher.peer_identity());
    assert_eq!(published.topic, "argus-defense/stream/s1");

    let events = drain_until_end(&mut rx).await;

    let audio_bytes: usize = events
        .iter()
        .filter_map(|e| match e {
            SubscriberEvent::Audio { chunk, .. } => Some(chunk.data.len()),
            _ => None,
        })
        .sum();
    let audio_events = events
        .iter()
        .filter(|e| matches!(e, SubscriberEvent::Audio { .. }))
        .count();
    assert_eq!(audio_events, 2);
    assert_eq!(audio_bytes, 6);

    match events.last() {
        Some(SubscriberEvent::End {
            total_bytes,
            total_chunks,
            reason,
            ..
        }) => {
            assert_eq!(*total_bytes, 6);
            assert_eq!(*total_chunks, 2);
            assert!(reason.is_none());
        }
        other => panic!("expected End, got {:?}", other),
    }

    let buffer = listener.subscriber().stream_buffer("s1").await.unwrap();
    assert!(buffer.ended);
    assert_eq!(buffer.total_bytes, 6);
    let mut bytes = buffer.contiguous();
    bytes.sort();
    assert_eq!(bytes, b"AAABBB");
    assert_eq!(
        buffer.metadata.and_then(|m| m.name).as_deref(),
        Some("Fire Dispatch")
    );

    // A finished stream is withdrawn from the directory
    timeout(TEST_TIMEOUT, async {
        while !listener
            .directory()
            .discovered_streams(StreamFilter::default())
            .await
            .is_empty()
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("ended stream still listed");
}

#[tokio::test]
async fn stopped_stream_tells_listeners() {
    let (publisher, listener, mut rx) = publisher_and_listener("live").await;
    let mut publisher_events = publisher.publisher().events().await.unwrap();

    publisher
        .publisher()
        .publish_stream(
            "live",
            StreamSource::custom(
                "mic",
                OpenEnded {
                    first: Some(Bytes::from_static(b"hello")),
                },
            ),
            StreamMetadata::default(),
        )
        .await
        .unwrap();

    // Wait for the first chunk to land, then check bookkeeping on both sides
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(SubscriberEvent::Audio { chunk, .. }) = rx.recv().await {
                assert_eq!(chunk.data, &b"hello"[..]);
                return;
            }
        }
    })
    .await
    .unwrap();

    let active = publisher.publisher().active_streams().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].bytes_published, 5);
    assert_eq!(active[0].chunks_published, 1);
    assert_eq!(active[0].listeners, 1);
    assert_eq!(active[0].metadata.name.as_deref(), Some("live"));

    let subscriptions = listener.subscriber().subscriptions().await;
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].bytes_received, 5);
    assert!(!subscriptions[0].ended);

    publisher.publisher().stop_stream("live").await;

    let events = drain_until_end(&mut rx).await;
    match events.last() {
        Some(SubscriberEvent::End { reason, total_bytes, .. }) => {
            assert_eq!(reason.as_deref(), Some("stopped"));
            assert_eq!(*total_bytes, 5);
        }
        other => panic!("expected End, got {:?}", other),
    }
    assert!(publisher.publisher().active_streams().await.is_empty());

    let mut saw_stopped = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(500), publisher_events.recv()).await {
        if event == (PublisherEvent::Stopped { stream_id: "live".into() }) {
            saw_stopped = true;
        }
    }
    assert!(saw_stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn capture_process_is_relayed_as_iq_data() {
    let (publisher, listener, mut rx) = publisher_and_listener("sdr").await;

    publisher
        .publisher()
        .publish_stream(
            "sdr",
            StreamSource::process("sh", ["-c", "printf 0123456789"]),
            StreamMetadata::default(),
        )
        .await
        .unwrap();

    let events = drain_until_end(&mut rx).await;
    let mut iq = Vec::new();
    for event in &events {
        match event {
            SubscriberEvent::IqData { chunk, .. } => iq.extend_from_slice(&chunk.data),
            SubscriberEvent::Audio { .. } => panic!("process output must arrive as iq_data"),
            _ => {}
        }
    }
    assert_eq!(iq, b"0123456789");

    let buffer = listener.subscriber().stream_buffer("sdr").await.unwrap();
    assert_eq!(buffer.total_bytes, 10);
    assert!(buffer.ended);
}

#[tokio::test]
async fn unsubscribed_listener_stops_receiving() {
    let (publisher, listener, mut rx) = publisher_and_listener("s2").await;

    listener.subscriber().unsubscribe_from_stream("s2").await;
    assert!(
        timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().is_none(),
        "listen channel should close on unsubscribe"
    );
    assert!(listener.subscriber().stream_buffer("s2").await.is_none());

    timeout(TEST_TIMEOUT, async {
        while !publisher
            .pubsub()
            .subscribers(&stream_topic(DEFAULT_NAMESPACE, "s2"))
            .await
            .is_empty()
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("publisher still sees the listener");
}
