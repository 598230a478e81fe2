//! # Stream Subscriber
//!
//! Joins `<namespace>/stream/<id>` topics and reassembles what arrives into
//! a [`StreamBuffer`] per stream.
//!
//! Chunks are appended in arrival order. Pub/sub delivery is best-effort, so
//! a buffer may have gaps or reordered chunks; nothing is resequenced.
//!
//! Each subscription has a forwarding task that decodes messages off the
//! pub/sub channel and hands them to the actor. Consumers observe a stream
//! either through the shared [`events`](StreamSubscriber::events) feed or a
//! per-stream [`listen`](StreamSubscriber::listen) channel, which closes when
//! the stream is unsubscribed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::gossipsub::GossipSub;
use crate::identity::Identity;
use crate::protocols::GossipSubRpc;
use crate::wire::{DEFAULT_NAMESPACE, StreamMessage, StreamMetadata, stream_topic};

pub const DEFAULT_MAX_BUFFERED_CHUNKS: usize = 4_096;

const COMMAND_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 1_024;
const LISTENER_CHANNEL_SIZE: usize = 256;

#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    pub namespace: String,
    /// Oldest chunks are dropped beyond this; byte and chunk totals keep
    /// counting.
    pub max_buffered_chunks: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_buffered_chunks: DEFAULT_MAX_BUFFERED_CHUNKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    NotSubscribed(String),
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscribeError::NotSubscribed(id) => write!(f, "not subscribed to stream {}", id),
        }
    }
}

impl std::error::Error for SubscribeError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub data: Bytes,
    /// Publisher clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub received_at: Instant,
}

#[derive(Debug, Clone)]
pub struct StreamBuffer {
    pub stream_id: String,
    pub metadata: Option<StreamMetadata>,
    pub audio_url: Option<String>,
    pub chunks: VecDeque<Chunk>,
    pub total_bytes: u64,
    pub chunks_received: u64,
    pub ended: bool,
    pub end_reason: Option<String>,
    pub started_at: Instant,
}

impl StreamBuffer {
    fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            metadata: None,
            audio_url: None,
            chunks: VecDeque::new(),
            total_bytes: 0,
            chunks_received: 0,
            ended: false,
            end_reason: None,
            started_at: Instant::now(),
        }
    }

    fn push(&mut self, chunk: Chunk, max_chunks: usize) {
        self.total_bytes += chunk.data.len() as u64;
        self.chunks_received += 1;
        self.chunks.push_back(chunk);
        while self.chunks.len() > max_chunks {
            self.chunks.pop_front();
        }
    }

    /// Buffered chunks concatenated in arrival order.
    pub fn contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.chunks.iter().map(|c| c.data.len()).sum());
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub stream_id: String,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionStatus {
    pub stream_id: String,
    pub topic: String,
    pub metadata: Option<StreamMetadata>,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub ended: bool,
    /// Remote peers subscribed to the same topic.
    pub peers: usize,
    pub uptime: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    Metadata {
        stream_id: String,
        metadata: StreamMetadata,
        audio_url: Option<String>,
    },
    Audio {
        stream_id: String,
        chunk: Chunk,
    },
    IqData {
        stream_id: String,
        chunk: Chunk,
    },
    End {
        stream_id: String,
        total_bytes: u64,
        total_chunks: u64,
        reason: Option<String>,
    },
}

impl SubscriberEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            SubscriberEvent::Metadata { stream_id, .. }
            | SubscriberEvent::Audio { stream_id, .. }
            | SubscriberEvent::IqData { stream_id, .. }
            | SubscriberEvent::End { stream_id, .. } => stream_id,
        }
    }
}

struct StreamState {
    /// Distinguishes a resubscribed stream from a stale forwarder.
    generation: u64,
    topic: String,
    buffer: StreamBuffer,
    forwarder: JoinHandle<()>,
    listeners: Vec<mpsc::Sender<SubscriberEvent>>,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<anyhow::Result<SubscriptionInfo>>),
    Unsubscribe(String, oneshot::Sender<()>),
    Buffer(String, oneshot::Sender<Option<StreamBuffer>>),
    Subscriptions(oneshot::Sender<Vec<SubscriptionStatus>>),
    Listen(
        String,
        oneshot::Sender<anyhow::Result<mpsc::Receiver<SubscriberEvent>>>,
    ),
    /// Decoded by a forwarding task.
    Incoming {
        stream_id: String,
        generation: u64,
        from: Identity,
        message: StreamMessage,
    },
    StopAll(oneshot::Sender<()>),
    Quit,
}

// ============================================================================
// StreamSubscriber Handle (public API - cheap to clone)
// ============================================================================

pub struct StreamSubscriber<N: GossipSubRpc> {
    cmd_tx: mpsc::Sender<Command>,
    events_rx: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<SubscriberEvent>>>>,
    _phantom: std::marker::PhantomData<fn() -> N>,
}

impl<N: GossipSubRpc> Clone for StreamSubscriber<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_rx: self.events_rx.clone(),
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<N: GossipSubRpc> StreamSubscriber<N> {
    pub fn spawn(gossipsub: GossipSub<N>, config: SubscriberConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let actor = SubscriberActor {
            gossipsub,
            config,
            streams: HashMap::new(),
            next_generation: 0,
            cmd_tx: cmd_tx.downgrade(),
            events_tx,
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            cmd_tx,
            events_rx: Arc::new(tokio::sync::Mutex::new(Some(events_rx))),
            _phantom: std::marker::PhantomData,
        }
    }

    /// Start receiving `stream_id`. Subscribing twice keeps the existing
    /// buffer.
    pub async fn subscribe_to_stream(&self, stream_id: &str) -> anyhow::Result<SubscriptionInfo> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(stream_id.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("subscriber actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("subscriber actor closed"))?
    }

    /// Leave the stream topic and discard its buffer. Unknown ids are ignored.
    pub async fn unsubscribe_from_stream(&self, stream_id: &str) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Unsubscribe(stream_id.to_string(), tx))
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn stream_buffer(&self, stream_id: &str) -> Option<StreamBuffer> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Buffer(stream_id.to_string(), tx))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionStatus> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Subscriptions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Events for every subscribed stream. Returns `None` after the first call.
    pub async fn events(&self) -> Option<mpsc::Receiver<SubscriberEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Events for one stream only, from now on. The channel closes when the
    /// stream is unsubscribed.
    pub async fn listen(&self, stream_id: &str) -> anyhow::Result<mpsc::Receiver<SubscriberEvent>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Listen(stream_id.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("subscriber actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("subscriber actor closed"))?
    }

    /// Unsubscribe from everything.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StopAll(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Subscriber Actor
// ============================================================================

struct SubscriberActor<N: GossipSubRpc> {
    gossipsub: GossipSub<N>,
    config: SubscriberConfig,
    streams: HashMap<String, StreamState>,
    next_generation: u64,
    cmd_tx: mpsc::WeakSender<Command>,
    events_tx: mpsc::Sender<SubscriberEvent>,
}

impl<N: GossipSubRpc> SubscriberActor<N> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Subscribe(stream_id, reply) => {
                    let _ = reply.send(self.subscribe(stream_id).await);
                }
                Command::Unsubscribe(stream_id, reply) => {
                    self.unsubscribe(&stream_id).await;
                    let _ = reply.send(());
                }
                Command::Buffer(stream_id, reply) => {
                    let _ = reply.send(self.streams.get(&stream_id).map(|s| s.buffer.clone()));
                }
                Command::Subscriptions(reply) => {
                    let _ = reply.send(self.statuses().await);
                }
                Command::Listen(stream_id, reply) => {
                    let _ = reply.send(self.listen(&stream_id));
                }
                Command::Incoming {
                    stream_id,
                    generation,
                    from,
                    message,
                } => {
                    self.incoming(&stream_id, generation, from, message);
                }
                Command::StopAll(reply) => {
                    self.unsubscribe_all().await;
                    let _ = reply.send(());
                }
                Command::Quit => {
                    self.unsubscribe_all().await;
                    break;
                }
            }
        }
        debug!("subscriber actor shutting down");
    }

    async fn subscribe(&mut self, stream_id: String) -> anyhow::Result<SubscriptionInfo> {
        if let Some(state) = self.streams.get(&stream_id) {
            return Ok(SubscriptionInfo {
                stream_id,
                topic: state.topic.clone(),
            });
        }

        let topic = stream_topic(&self.config.namespace, &stream_id);
        let mut subscription = self.gossipsub.subscribe(&topic).await?;

        self.next_generation += 1;
        let generation = self.next_generation;
        let cmd_tx = self.cmd_tx.clone();
        let forward_id = stream_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                let message = match StreamMessage::decode(&msg.data) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(
                            stream_id = %forward_id,
                            peer = %msg.source.short(),
                            error = %e,
                            "dropping undecodable stream message"
                        );
                        continue;
                    }
                };
                let Some(tx) = cmd_tx.upgrade() else { break };
                let cmd = Command::Incoming {
                    stream_id: forward_id.clone(),
                    generation,
                    from: msg.source,
                    message,
                };
                if tx.send(cmd).await.is_err() {
                    break;
                }
            }
        });

        self.streams.insert(stream_id.clone(), StreamState {
            generation,
            topic: topic.clone(),
            buffer: StreamBuffer::new(&stream_id),
            forwarder,
            listeners: Vec::new(),
        });
        info!(stream_id = %stream_id, topic = %topic, "subscribed to stream");

        Ok(SubscriptionInfo { stream_id, topic })
    }

    async fn unsubscribe(&mut self, stream_id: &str) {
        let Some(state) = self.streams.remove(stream_id) else {
            trace!(stream_id = %stream_id, "unsubscribe from unknown stream ignored");
            return;
        };
        state.forwarder.abort();
        if let Err(e) = self.gossipsub.unsubscribe(&state.topic).await {
            debug!(stream_id = %stream_id, error = %e, "failed to leave stream topic");
        }
        info!(
            stream_id = %stream_id,
            bytes = state.buffer.total_bytes,
            chunks = state.buffer.chunks_received,
            "unsubscribed from stream"
        );
    }

    async fn unsubscribe_all(&mut self) {
        let ids: Vec<String> = self.streams.keys().cloned().collect();
        for id in ids {
            self.unsubscribe(&id).await;
        }
    }

    fn listen(&mut self, stream_id: &str) -> anyhow::Result<mpsc::Receiver<SubscriberEvent>> {
        let state = self
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| SubscribeError::NotSubscribed(stream_id.to_string()))?;
        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_SIZE);
        state.listeners.push(tx);
        Ok(rx)
    }

    async fn statuses(&self) -> Vec<SubscriptionStatus> {
        let mut statuses = Vec::with_capacity(self.streams.len());
        for (stream_id, state) in &self.streams {
            statuses.push(SubscriptionStatus {
                stream_id: stream_id.clone(),
                topic: state.topic.clone(),
                metadata: state.buffer.metadata.clone(),
                bytes_received: state.buffer.total_bytes,
                chunks_received: state.buffer.chunks_received,
                ended: state.buffer.ended,
                peers: self.gossipsub.subscribers(&state.topic).await.len(),
                uptime: state.buffer.started_at.elapsed(),
            });
        }
        statuses.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        statuses
    }

    fn incoming(&mut self, stream_id: &str, generation: u64, from: Identity, message: StreamMessage) {
        let max_chunks = self.config.max_buffered_chunks;
        let Some(state) = self.streams.get_mut(stream_id) else {
            return;
        };
        if state.generation != generation {
            return;
        }
        if message.stream_id() != stream_id {
            debug!(
                stream_id = %stream_id,
                claimed = %message.stream_id(),
                peer = %from.short(),
                "dropping message for another stream"
            );
            return;
        }

        let buffer = &mut state.buffer;
        let event = match message {
            StreamMessage::Metadata {
                audio_url,
                source,
                mut metadata,
                ..
            } => {
                if metadata.source.is_none() {
                    metadata.source = source;
                }
                buffer.metadata = Some(metadata.clone());
                buffer.audio_url = audio_url.clone();
                debug!(stream_id = %stream_id, "stream metadata received");
                SubscriberEvent::Metadata {
                    stream_id: stream_id.to_string(),
                    metadata,
                    audio_url,
                }
            }
            StreamMessage::Audio {
                chunk, timestamp, ..
            } => {
                let chunk = Chunk {
                    data: Bytes::from(chunk),
                    timestamp,
                    received_at: Instant::now(),
                };
                buffer.push(chunk.clone(), max_chunks);
                SubscriberEvent::Audio {
                    stream_id: stream_id.to_string(),
                    chunk,
                }
            }
            StreamMessage::IqData {
                data, timestamp, ..
            } => {
                let chunk = Chunk {
                    data: Bytes::from(data),
                    timestamp,
                    received_at: Instant::now(),
                };
                buffer.push(chunk.clone(), max_chunks);
                SubscriberEvent::IqData {
                    stream_id: stream_id.to_string(),
                    chunk,
                }
            }
            StreamMessage::End {
                total_bytes,
                total_chunks,
                reason,
                ..
            } => {
                buffer.ended = true;
                buffer.end_reason = reason.clone();
                let total_bytes = total_bytes.unwrap_or(buffer.total_bytes);
                let total_chunks = total_chunks.unwrap_or(buffer.chunks_received);
                info!(
                    stream_id = %stream_id,
                    total_bytes,
                    total_chunks,
                    received_bytes = buffer.total_bytes,
                    reason = ?reason,
                    "stream ended"
                );
                SubscriberEvent::End {
                    stream_id: stream_id.to_string(),
                    total_bytes,
                    total_chunks,
                    reason,
                }
            }
        };

        state.listeners.retain(|l| !l.is_closed());
        for listener in &state.listeners {
            if listener.try_send(event.clone()).is_err() {
                trace!(stream_id = %stream_id, "stream listener lagging, event dropped");
            }
        }
        if self.events_tx.try_send(event).is_err() {
            trace!("subscriber event dropped: no reader or channel full");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossipsub::GossipSubConfig;
    use crate::identity::{Contact, Keypair};
    use crate::messages::GossipSubRequest;
    use async_trait::async_trait;

    struct NoNetwork;

    #[async_trait]
    impl GossipSubRpc for NoNetwork {
        async fn send_gossipsub(&self, _to: &Contact, _message: GossipSubRequest) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn loopback() -> (GossipSub<NoNetwork>, StreamSubscriber<NoNetwork>) {
        let config = GossipSubConfig {
            emit_self: true,
            ..Default::default()
        };
        let gossipsub = GossipSub::spawn(Arc::new(NoNetwork), Keypair::generate(), config);
        let subscriber = StreamSubscriber::spawn(gossipsub.clone(), SubscriberConfig {
            max_buffered_chunks: 2,
            ..Default::default()
        });
        (gossipsub, subscriber)
    }

    async fn send(gossipsub: &GossipSub<NoNetwork>, msg: StreamMessage) {
        gossipsub
            .publish(&stream_topic(DEFAULT_NAMESPACE, msg.stream_id()), msg.encode())
            .await
            .unwrap();
    }

    async fn next(rx: &mut mpsc::Receiver<SubscriberEvent>) -> SubscriberEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for subscriber event")
            .expect("subscriber events closed")
    }

    fn audio(stream_id: &str, bytes: &[u8]) -> StreamMessage {
        StreamMessage::Audio {
            stream_id: stream_id.to_string(),
            chunk: bytes.to_vec(),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn chunks_are_buffered_until_end() {
        let (gossipsub, subscriber) = loopback();
        let mut events = subscriber.events().await.unwrap();

        let info = subscriber.subscribe_to_stream("s1").await.unwrap();
        assert_eq!(info.topic, "argus-defense/stream/s1");
        assert_eq!(subscriber.subscribe_to_stream("s1").await.unwrap(), info);

        send(&gossipsub, StreamMessage::Metadata {
            stream_id: "s1".into(),
            audio_url: Some("http://x/a.m4a".into()),
            source: Some("http://x/a.m4a".into()),
            metadata: StreamMetadata::named("Fire"),
            timestamp: 1,
        })
        .await;
        send(&gossipsub, audio("s1", b"AAA")).await;
        send(&gossipsub, audio("s1", b"BBB")).await;
        send(&gossipsub, StreamMessage::End {
            stream_id: "s1".into(),
            timestamp: 2,
            total_bytes: None,
            total_chunks: None,
            reason: None,
        })
        .await;

        assert!(matches!(next(&mut events).await, SubscriberEvent::Metadata { .. }));
        assert!(matches!(next(&mut events).await, SubscriberEvent::Audio { .. }));
        assert!(matches!(next(&mut events).await, SubscriberEvent::Audio { .. }));
        assert_eq!(next(&mut events).await, SubscriberEvent::End {
            stream_id: "s1".into(),
            total_bytes: 6,
            total_chunks: 2,
            reason: None,
        });

        let buffer = subscriber.stream_buffer("s1").await.unwrap();
        assert!(buffer.ended);
        assert_eq!(buffer.total_bytes, 6);
        assert_eq!(buffer.contiguous(), b"AAABBB");
        assert_eq!(buffer.metadata.unwrap().source.as_deref(), Some("http://x/a.m4a"));
        assert_eq!(buffer.audio_url.as_deref(), Some("http://x/a.m4a"));
    }

    #[tokio::test]
    async fn buffer_retention_is_bounded() {
        let (gossipsub, subscriber) = loopback();
        let mut events = subscriber.events().await.unwrap();
        subscriber.subscribe_to_stream("s1").await.unwrap();

        for piece in [b"A", b"B", b"C"] {
            send(&gossipsub, audio("s1", piece)).await;
        }
        for _ in 0..3 {
            next(&mut events).await;
        }

        let buffer = subscriber.stream_buffer("s1").await.unwrap();
        assert_eq!(buffer.chunks.len(), 2);
        assert_eq!(buffer.contiguous(), b"BC");
        assert_eq!(buffer.total_bytes, 3);
        assert_eq!(buffer.chunks_received, 3);
    }

    #[tokio::test]
    async fn undecodable_messages_leave_buffer_untouched() {
        let (gossipsub, subscriber) = loopback();
        let mut events = subscriber.events().await.unwrap();
        subscriber.subscribe_to_stream("s1").await.unwrap();

        gossipsub
            .publish("argus-defense/stream/s1", b"{not json".to_vec())
            .await
            .unwrap();
        send(&gossipsub, audio("s1", b"ok")).await;

        match next(&mut events).await {
            SubscriberEvent::Audio { chunk, .. } => assert_eq!(chunk.data, &b"ok"[..]),
            other => panic!("unexpected {:?}", other),
        }
        let buffer = subscriber.stream_buffer("s1").await.unwrap();
        assert_eq!(buffer.chunks_received, 1);
    }

    #[tokio::test]
    async fn publisher_totals_win_on_end() {
        let (gossipsub, subscriber) = loopback();
        let mut rx = {
            subscriber.subscribe_to_stream("s1").await.unwrap();
            subscriber.listen("s1").await.unwrap()
        };

        send(&gossipsub, StreamMessage::End {
            stream_id: "s1".into(),
            timestamp: 2,
            total_bytes: Some(10),
            total_chunks: Some(3),
            reason: Some("stopped".into()),
        })
        .await;

        assert_eq!(next(&mut rx).await, SubscriberEvent::End {
            stream_id: "s1".into(),
            total_bytes: 10,
            total_chunks: 3,
            reason: Some("stopped".into()),
        });
        let buffer = subscriber.stream_buffer("s1").await.unwrap();
        assert_eq!(buffer.end_reason.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn listen_requires_subscription_and_closes_on_unsubscribe() {
        let (_gossipsub, subscriber) = loopback();

        let err = subscriber.listen("nope").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<SubscribeError>(),
            Some(&SubscribeError::NotSubscribed("nope".into()))
        );

        subscriber.subscribe_to_stream("s1").await.unwrap();
        let mut rx = subscriber.listen("s1").await.unwrap();
        subscriber.unsubscribe_from_stream("s1").await;
        subscriber.unsubscribe_from_stream("s1").await;

        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));
        assert!(subscriber.stream_buffer("s1").await.is_none());
        assert!(subscriber.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn resubscribe_starts_fresh_buffer() {
        let (gossipsub, subscriber) = loopback();
        let mut events = subscriber.events().await.unwrap();

        subscriber.subscribe_to_stream("s1").await.unwrap();
        send(&gossipsub, audio("s1", b"old")).await;
        next(&mut events).await;

        subscriber.unsubscribe_from_stream("s1").await;
        subscriber.subscribe_to_stream("s1").await.unwrap();

        let buffer = subscriber.stream_buffer("s1").await.unwrap();
        assert_eq!(buffer.total_bytes, 0);
        assert!(!buffer.ended);

        let statuses = subscriber.subscriptions().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].stream_id, "s1");
        assert_eq!(statuses[0].peers, 0);
    }
}
