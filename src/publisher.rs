//! # Stream Publisher
//!
//! Turns a [`StreamSource`] into a sequence of messages on
//! `<namespace>/stream/<id>`:
//!
//! ```text
//! metadata ─► audio | iq_data ─► ... ─► end
//! ```
//!
//! Each published stream is a session owned by the publisher actor. The
//! bytes are moved by a spawned pump task so a slow source never stalls the
//! actor. The pump reports back when the source ends or fails; stopping a
//! stream aborts the pump, which drops the source (cancelling an HTTP
//! download or killing a capture process).
//!
//! Publishing is fire-and-forget per chunk. Listeners joining late miss the
//! earlier chunks; there is no replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::directory::StreamDirectory;
use crate::gossipsub::{GossipSub, MessageRejection};
use crate::identity::{Identity, now_ms};
use crate::protocols::GossipSubRpc;
use crate::source::{PayloadKind, StreamSource, split_block};
use crate::wire::{DEFAULT_NAMESPACE, StreamMessage, StreamMetadata, stream_topic};

/// 32 KiB of raw bytes is ~43 KiB of base64, inside the pub/sub size limit.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 32 * 1024;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const STATS_LOG_EVERY_CHUNKS: u64 = 100;

/// Pause before retrying a chunk refused by the local publish rate limit.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_RATE_LIMIT_RETRIES: usize = 40;

const COMMAND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub namespace: String,
    pub max_chunk_bytes: usize,
    pub fetch_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    AlreadyPublishing(String),
    /// The source could not be opened or failed mid-stream.
    Source(String),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::AlreadyPublishing(id) => write!(f, "stream {} is already being published", id),
            PublishError::Source(reason) => write!(f, "stream source failed: {}", reason),
        }
    }
}

impl std::error::Error for PublishError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedStream {
    pub stream_id: String,
    pub topic: String,
    pub peer_id: Identity,
}

#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub stream_id: String,
    pub topic: String,
    pub source: String,
    pub metadata: StreamMetadata,
    pub bytes_published: u64,
    pub chunks_published: u64,
    /// Remote peers subscribed to the stream topic.
    pub listeners: usize,
    pub uptime: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublisherEvent {
    Started {
        stream_id: String,
        topic: String,
    },
    /// The source reached EOF.
    Ended {
        stream_id: String,
        total_bytes: u64,
        total_chunks: u64,
    },
    Failed {
        stream_id: String,
        error: PublishError,
    },
    Stopped {
        stream_id: String,
    },
}

#[derive(Debug, Default)]
struct Progress {
    bytes: AtomicU64,
    chunks: AtomicU64,
    end_sent: AtomicBool,
}

impl Progress {
    fn totals(&self) -> (u64, u64) {
        (
            self.bytes.load(Ordering::Relaxed),
            self.chunks.load(Ordering::Relaxed),
        )
    }

    fn record(&self, len: u64) -> u64 {
        self.bytes.fetch_add(len, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns `true` for the first caller only; one `end` per session.
    fn claim_end(&self) -> bool {
        !self.end_sent.swap(true, Ordering::AcqRel)
    }
}

struct Session {
    /// Distinguishes a restarted stream from the pump of a previous run.
    generation: u64,
    topic: String,
    source: String,
    metadata: StreamMetadata,
    started_at: Instant,
    progress: Arc<Progress>,
    pump: JoinHandle<()>,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Publish {
        stream_id: String,
        source: StreamSource,
        metadata: StreamMetadata,
        reply: oneshot::Sender<anyhow::Result<PublishedStream>>,
    },
    Stop {
        stream_id: String,
        reply: oneshot::Sender<()>,
    },
    StopAll(oneshot::Sender<()>),
    Active(oneshot::Sender<Vec<ActiveStream>>),
    /// Sent by a pump task when its source is exhausted or broken.
    PumpFinished {
        stream_id: String,
        generation: u64,
        outcome: Result<(), PublishError>,
    },
    Quit,
}

// ============================================================================
// StreamPublisher Handle (public API - cheap to clone)
// ============================================================================

pub struct StreamPublisher<N: GossipSubRpc> {
    cmd_tx: mpsc::Sender<Command>,
    events_rx: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<PublisherEvent>>>>,
    _phantom: std::marker::PhantomData<fn() -> N>,
}

impl<N: GossipSubRpc> Clone for StreamPublisher<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_rx: self.events_rx.clone(),
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<N: GossipSubRpc> StreamPublisher<N> {
    pub fn spawn(
        gossipsub: GossipSub<N>,
        directory: StreamDirectory<N>,
        config: PublisherConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let actor = PublisherActor {
            identity: gossipsub.identity(),
            gossipsub,
            directory,
            config,
            sessions: HashMap::new(),
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

    /// Announce `stream_id` and start relaying `source` onto its topic.
    ///
    /// Returns once the metadata message and directory announcement are
    /// published. How the source ends is reported on [`events`](Self::events).
    pub async fn publish_stream(
        &self,
        stream_id: &str,
        source: StreamSource,
        metadata: StreamMetadata,
    ) -> anyhow::Result<PublishedStream> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                stream_id: stream_id.to_string(),
                source,
                metadata,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("publisher actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("publisher actor closed"))?
    }

    /// Abort a stream and tell listeners it stopped. Unknown ids are ignored.
    pub async fn stop_stream(&self, stream_id: &str) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Stop {
                stream_id: stream_id.to_string(),
                reply: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn active_streams(&self) -> Vec<ActiveStream> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Active(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn events(&self) -> Option<mpsc::Receiver<PublisherEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Stop every active stream.
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
// Publisher Actor
// ============================================================================

struct PublisherActor<N: GossipSubRpc> {
    identity: Identity,
    gossipsub: GossipSub<N>,
    directory: StreamDirectory<N>,
    config: PublisherConfig,
    sessions: HashMap<String, Session>,
    next_generation: u64,
    /// Weak so pumps never keep the actor alive.
    cmd_tx: mpsc::WeakSender<Command>,
    events_tx: mpsc::Sender<PublisherEvent>,
}

impl<N: GossipSubRpc> PublisherActor<N> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Publish {
                    stream_id,
                    source,
                    metadata,
                    reply,
                } => {
                    let result = self.publish(stream_id, source, metadata).await;
                    let _ = reply.send(result);
                }
                Command::Stop { stream_id, reply } => {
                    self.stop_stream(&stream_id).await;
                    let _ = reply.send(());
                }
                Command::StopAll(reply) => {
                    self.stop_all().await;
                    let _ = reply.send(());
                }
                Command::Active(reply) => {
                    let _ = reply.send(self.active().await);
                }
                Command::PumpFinished {
                    stream_id,
                    generation,
                    outcome,
                } => {
                    self.pump_finished(stream_id, generation, outcome).await;
                }
                Command::Quit => {
                    self.stop_all().await;
                    break;
                }
            }
        }
        debug!("publisher actor shutting down");
    }

    async fn publish(
        &mut self,
        stream_id: String,
        source: StreamSource,
        mut metadata: StreamMetadata,
    ) -> anyhow::Result<PublishedStream> {
        if self.sessions.contains_key(&stream_id) {
            return Err(PublishError::AlreadyPublishing(stream_id).into());
        }

        let topic = stream_topic(&self.config.namespace, &stream_id);
        let label = source.label();
        let audio_url = source.audio_url().map(str::to_string);
        let kind = source.payload_kind();

        let intro = StreamMessage::Metadata {
            stream_id: stream_id.clone(),
            audio_url: audio_url.clone(),
            source: Some(label.clone()),
            metadata: metadata.clone(),
            timestamp: now_ms(),
        };
        self.gossipsub.publish(&topic, intro.encode()).await?;

        if metadata.name.is_none() {
            metadata.name = Some(stream_id.clone());
        }
        if metadata.audio_url.is_none() {
            metadata.audio_url = audio_url;
        }
        if metadata.source.is_none() {
            metadata.source = Some(label.clone());
        }
        let entry = match self.directory.announce_stream(&stream_id, metadata).await {
            Ok(entry) => entry,
            Err(e) => {
                // Listeners already saw the metadata message.
                let end = StreamMessage::End {
                    stream_id: stream_id.clone(),
                    timestamp: now_ms(),
                    total_bytes: Some(0),
                    total_chunks: Some(0),
                    reason: Some(format!("error: {:#}", e)),
                };
                if let Err(e) = self.gossipsub.publish(&topic, end.encode()).await {
                    debug!(stream_id = %stream_id, error = %e, "failed to publish end of stream");
                }
                return Err(e.context("failed to announce stream"));
            }
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let progress = Arc::new(Progress::default());
        let pump = Pump {
            gossipsub: self.gossipsub.clone(),
            stream_id: stream_id.clone(),
            topic: topic.clone(),
            kind,
            max_chunk_bytes: self.config.max_chunk_bytes,
            progress: progress.clone(),
        };
        let fetch_timeout = self.config.fetch_timeout;
        let cmd_tx = self.cmd_tx.clone();
        let pump_stream_id = stream_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = pump.run(source, fetch_timeout).await;
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx
                    .send(Command::PumpFinished {
                        stream_id: pump_stream_id,
                        generation,
                        outcome,
                    })
                    .await;
            }
        });

        self.sessions.insert(stream_id.clone(), Session {
            generation,
            topic: topic.clone(),
            source: label.clone(),
            metadata: entry.metadata,
            started_at: Instant::now(),
            progress,
            pump: handle,
        });

        info!(stream_id = %stream_id, topic = %topic, source = %label, "publishing stream");
        self.emit(PublisherEvent::Started {
            stream_id: stream_id.clone(),
            topic: topic.clone(),
        });

        Ok(PublishedStream {
            stream_id,
            topic,
            peer_id: self.identity,
        })
    }

    async fn stop_stream(&mut self, stream_id: &str) {
        let Some(session) = self.sessions.remove(stream_id) else {
            debug!(stream_id = %stream_id, "stop requested for unknown stream");
            return;
        };
        session.pump.abort();

        let (total_bytes, total_chunks) = session.progress.totals();
        if session.progress.claim_end() {
            let end = StreamMessage::End {
                stream_id: stream_id.to_string(),
                timestamp: now_ms(),
                total_bytes: Some(total_bytes),
                total_chunks: Some(total_chunks),
                reason: Some("stopped".to_string()),
            };
            if let Err(e) = self.gossipsub.publish(&session.topic, end.encode()).await {
                debug!(stream_id = %stream_id, error = %e, "failed to publish end of stream");
            }
        } else {
            trace!(stream_id = %stream_id, "end already sent by the pump");
        }
        self.deregister(stream_id).await;

        info!(stream_id = %stream_id, total_bytes, total_chunks, "stopped stream");
        self.emit(PublisherEvent::Stopped {
            stream_id: stream_id.to_string(),
        });
    }

    async fn stop_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.stop_stream(&id).await;
        }
    }

    async fn pump_finished(
        &mut self,
        stream_id: String,
        generation: u64,
        outcome: Result<(), PublishError>,
    ) {
        match self.sessions.get(&stream_id) {
            Some(session) if session.generation == generation => {}
            _ => {
                trace!(stream_id = %stream_id, "ignoring completion of a stopped stream");
                return;
            }
        }
        let Some(session) = self.sessions.remove(&stream_id) else {
            return;
        };
        self.deregister(&stream_id).await;

        let (total_bytes, total_chunks) = session.progress.totals();
        let event = match outcome {
            Ok(()) => {
                info!(stream_id = %stream_id, total_bytes, total_chunks, "stream ended");
                PublisherEvent::Ended {
                    stream_id,
                    total_bytes,
                    total_chunks,
                }
            }
            Err(error) => {
                warn!(stream_id = %stream_id, error = %error, "stream failed");
                PublisherEvent::Failed { stream_id, error }
            }
        };
        self.emit(event);
    }

    async fn deregister(&self, stream_id: &str) {
        if let Err(e) = self.directory.deregister_stream(stream_id).await {
            debug!(stream_id = %stream_id, error = %e, "failed to deregister stream");
        }
    }

    async fn active(&self) -> Vec<ActiveStream> {
        let mut streams = Vec::with_capacity(self.sessions.len());
        for (stream_id, session) in &self.sessions {
            let (bytes_published, chunks_published) = session.progress.totals();
            streams.push(ActiveStream {
                stream_id: stream_id.clone(),
                topic: session.topic.clone(),
                source: session.source.clone(),
                metadata: session.metadata.clone(),
                bytes_published,
                chunks_published,
                listeners: self.gossipsub.subscribers(&session.topic).await.len(),
                uptime: session.started_at.elapsed(),
            });
        }
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        streams
    }

    fn emit(&self, event: PublisherEvent) {
        if self.events_tx.try_send(event).is_err() {
            trace!("publisher event dropped: no reader or channel full");
        }
    }
}

// ============================================================================
// Pump: source -> topic
// ============================================================================

struct Pump<N: GossipSubRpc> {
    gossipsub: GossipSub<N>,
    stream_id: String,
    topic: String,
    kind: PayloadKind,
    max_chunk_bytes: usize,
    progress: Arc<Progress>,
}

impl<N: GossipSubRpc> Pump<N> {
    /// Relay the source until EOF, then publish `end`. On failure an `end`
    /// carrying the error is published before returning it.
    async fn run(self, source: StreamSource, fetch_timeout: Duration) -> Result<(), PublishError> {
        let result = self.relay(source, fetch_timeout).await;
        if !self.progress.claim_end() {
            return result.map_err(|e| PublishError::Source(format!("{:#}", e)));
        }
        let (total_bytes, total_chunks) = self.progress.totals();
        let reason = match &result {
            Ok(()) => None,
            Err(e) => Some(format!("error: {:#}", e)),
        };
        let end = StreamMessage::End {
            stream_id: self.stream_id.clone(),
            timestamp: now_ms(),
            total_bytes: Some(total_bytes),
            total_chunks: Some(total_chunks),
            reason,
        };
        self.send(end).await;
        result.map_err(|e| PublishError::Source(format!("{:#}", e)))
    }

    async fn relay(&self, source: StreamSource, fetch_timeout: Duration) -> anyhow::Result<()> {
        let mut source = source.open(fetch_timeout).await?;
        while let Some(block) = source.next_chunk().await? {
            for piece in split_block(block, self.max_chunk_bytes) {
                let len = piece.len() as u64;
                let msg = match self.kind {
                    PayloadKind::Audio => StreamMessage::Audio {
                        stream_id: self.stream_id.clone(),
                        chunk: piece.to_vec(),
                        timestamp: now_ms(),
                    },
                    PayloadKind::IqData => StreamMessage::IqData {
                        stream_id: self.stream_id.clone(),
                        data: piece.to_vec(),
                        timestamp: now_ms(),
                    },
                };
                if !self.send(msg).await {
                    continue;
                }

                let chunks = self.progress.record(len);
                if chunks % STATS_LOG_EVERY_CHUNKS == 0 {
                    let listeners = self.gossipsub.subscribers(&self.topic).await.len();
                    info!(
                        stream_id = %self.stream_id,
                        chunks,
                        bytes = self.progress.bytes.load(Ordering::Relaxed),
                        listeners,
                        "stream progress"
                    );
                }
            }
        }
        Ok(())
    }

    /// Fire-and-forget, except that a full local rate window is waited out.
    /// Returns whether the message was handed to the pub/sub engine.
    async fn send(&self, msg: StreamMessage) -> bool {
        let data = msg.encode();
        for _ in 0..MAX_RATE_LIMIT_RETRIES {
            match self.gossipsub.publish(&self.topic, data.clone()).await {
                Ok(_) => return true,
                Err(e)
                    if e.downcast_ref::<MessageRejection>()
                        == Some(&MessageRejection::RateLimited) =>
                {
                    tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                }
                Err(e) => {
                    debug!(stream_id = %self.stream_id, error = %e, "chunk not published");
                    return false;
                }
            }
        }
        warn!(stream_id = %self.stream_id, "chunk dropped after repeated rate limiting");
        false
    }
}
