//! # Stream Directory
//!
//! An eventually-consistent registry of live streams, built on the
//! `<namespace>/stream-directory` pub/sub topic.
//!
//! Every node keeps two sets:
//!
//! - **local**: streams this node announced. Authoritative, never aged.
//! - **discovered**: streams learned from other nodes' ANNOUNCE, RESPONSE
//!   and HEARTBEAT messages. Evicted once not seen for `stale_threshold`.
//!
//! The directory owns no network state of its own. Liveness is carried by
//! periodic HEARTBEATs for every local stream; a publisher that disappears
//! without a DEREGISTER simply ages out of everyone else's view.
//!
//! Conflicting ANNOUNCEs for one stream id from different publishers are
//! resolved last-writer-wins. Deciding who legitimately owns a stream id is
//! left to callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tracing::{debug, info, trace, warn};

use crate::gossipsub::{GossipSub, ReceivedMessage, Subscription};
use crate::identity::{Identity, now_ms};
use crate::protocols::GossipSubRpc;
use crate::wire::{
    AnnouncedStream, DEFAULT_NAMESPACE, DirectoryMessage, StreamFilter, StreamMetadata,
    directory_topic, stream_topic,
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(120);

const COMMAND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    pub namespace: String,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    /// Discovered entries not seen for longer than this are evicted.
    pub stale_threshold: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    NotStarted,
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::NotStarted => write!(f, "stream directory is not started"),
        }
    }
}

impl std::error::Error for DirectoryError {}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub stream_id: String,
    pub metadata: StreamMetadata,
    pub publisher: Identity,
    pub last_seen: Instant,
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCount {
    pub local: usize,
    pub discovered: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Deregistered,
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    /// A stream id not previously in the discovered set.
    Discovered(DirectoryEntry),
    /// A known stream was re-announced or heartbeated.
    Refreshed { stream_id: String, publisher: Identity },
    Removed {
        stream_id: String,
        reason: RemovalReason,
    },
}

// ============================================================================
// Catalog: the two stream sets, free of I/O
// ============================================================================

#[derive(Debug, Default)]
struct Catalog {
    local: HashMap<String, DirectoryEntry>,
    discovered: HashMap<String, DirectoryEntry>,
}

/// Outcome of recording a discovered stream.
#[derive(Debug, PartialEq, Eq)]
enum Upsert {
    Inserted,
    Replaced,
}

impl Catalog {
    fn insert_local(&mut self, entry: DirectoryEntry) {
        self.local.insert(entry.stream_id.clone(), entry);
    }

    fn remove_local(&mut self, stream_id: &str) -> Option<DirectoryEntry> {
        self.local.remove(stream_id)
    }

    /// Last writer wins.
    fn upsert_discovered(
        &mut self,
        stream_id: &str,
        metadata: StreamMetadata,
        publisher: Identity,
        now: Instant,
    ) -> (Upsert, DirectoryEntry) {
        let entry = DirectoryEntry {
            stream_id: stream_id.to_string(),
            metadata,
            publisher,
            last_seen: now,
            is_local: false,
        };
        let outcome = match self.discovered.insert(stream_id.to_string(), entry.clone()) {
            Some(_) => Upsert::Replaced,
            None => Upsert::Inserted,
        };
        (outcome, entry)
    }

    /// Bump `last_seen` of a known discovered stream. Unknown ids are ignored.
    fn touch(&mut self, stream_id: &str, now: Instant) -> Option<Identity> {
        let entry = self.discovered.get_mut(stream_id)?;
        if now > entry.last_seen {
            entry.last_seen = now;
        }
        Some(entry.publisher)
    }

    fn remove_discovered(&mut self, stream_id: &str) -> Option<DirectoryEntry> {
        self.discovered.remove(stream_id)
    }

    fn evict_stale(&mut self, now: Instant, threshold: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .discovered
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > threshold)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.discovered.remove(id);
        }
        stale
    }

    /// Matching discovered entries, most recently seen first.
    fn discovered(&self, filter: &StreamFilter) -> Vec<DirectoryEntry> {
        let mut entries: Vec<DirectoryEntry> = self
            .discovered
            .values()
            .filter(|e| filter.matches(&e.publisher, &e.metadata))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        entries
    }

    fn local(&self) -> Vec<DirectoryEntry> {
        let mut entries: Vec<DirectoryEntry> = self.local.values().cloned().collect();
        entries.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        entries
    }

    fn matching_local(&self, filter: &StreamFilter) -> Vec<AnnouncedStream> {
        self.local()
            .into_iter()
            .filter(|e| filter.matches(&e.publisher, &e.metadata))
            .map(|e| AnnouncedStream {
                stream_id: e.stream_id,
                metadata: e.metadata,
            })
            .collect()
    }

    fn count(&self) -> StreamCount {
        StreamCount {
            local: self.local.len(),
            discovered: self.discovered.len(),
            total: self.local.len() + self.discovered.len(),
        }
    }

    fn clear(&mut self) {
        self.local.clear();
        self.discovered.clear();
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Start(oneshot::Sender<anyhow::Result<()>>),
    Stop(oneshot::Sender<()>),
    Announce {
        stream_id: String,
        metadata: StreamMetadata,
        reply: oneshot::Sender<anyhow::Result<DirectoryEntry>>,
    },
    Deregister {
        stream_id: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Query {
        filter: StreamFilter,
        reply: oneshot::Sender<anyhow::Result<Vec<DirectoryEntry>>>,
    },
    Discovered(StreamFilter, oneshot::Sender<Vec<DirectoryEntry>>),
    Local(oneshot::Sender<Vec<DirectoryEntry>>),
    Count(oneshot::Sender<StreamCount>),
    IsStarted(oneshot::Sender<bool>),
    Quit,
}

// ============================================================================
// StreamDirectory Handle (public API - cheap to clone)
// ============================================================================

pub struct StreamDirectory<N: GossipSubRpc> {
    cmd_tx: mpsc::Sender<Command>,
    events_rx: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<DirectoryEvent>>>>,
    _phantom: std::marker::PhantomData<fn() -> N>,
}

impl<N: GossipSubRpc> Clone for StreamDirectory<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_rx: self.events_rx.clone(),
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<N: GossipSubRpc> StreamDirectory<N> {
    /// Spawn the directory in the Stopped state. `publisher_addrs` are
    /// advertised in every announcement so listeners can dial us directly.
    pub fn spawn(
        gossipsub: GossipSub<N>,
        publisher_addrs: Vec<String>,
        config: DirectoryConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let actor = DirectoryActor {
            identity: gossipsub.identity(),
            gossipsub,
            publisher_addrs,
            config,
            catalog: Catalog::default(),
            subscription: None,
            heartbeat: None,
            cleanup: None,
            events_tx,
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            cmd_tx,
            events_rx: Arc::new(tokio::sync::Mutex::new(Some(events_rx))),
            _phantom: std::marker::PhantomData,
        }
    }

    /// Join the directory topic and start the heartbeat and cleanup timers.
    /// Starting an already started directory does nothing.
    pub async fn start(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start(tx))
            .await
            .map_err(|_| anyhow::anyhow!("directory actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("directory actor closed"))?
    }

    /// Deregister every local stream, leave the topic and forget everything.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn is_started(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::IsStarted(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Announce a stream this node publishes. Fails with
    /// [`DirectoryError::NotStarted`] before [`start`](Self::start).
    pub async fn announce_stream(
        &self,
        stream_id: &str,
        metadata: StreamMetadata,
    ) -> anyhow::Result<DirectoryEntry> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Announce {
                stream_id: stream_id.to_string(),
                metadata,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("directory actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("directory actor closed"))?
    }

    /// Withdraw a local stream. Unknown ids and a stopped directory are no-ops.
    pub async fn deregister_stream(&self, stream_id: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Deregister {
                stream_id: stream_id.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("directory actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("directory actor closed"))?
    }

    /// Ask the network for matching streams. Answers arrive asynchronously;
    /// the returned list is what is already known.
    pub async fn query_streams(&self, filter: StreamFilter) -> anyhow::Result<Vec<DirectoryEntry>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Query { filter, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("directory actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("directory actor closed"))?
    }

    pub async fn discovered_streams(&self, filter: StreamFilter) -> Vec<DirectoryEntry> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Discovered(filter, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn local_streams(&self) -> Vec<DirectoryEntry> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Local(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stream_count(&self) -> StreamCount {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Count(tx)).await.is_err() {
            return StreamCount::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Directory change feed. Returns `None` after the first call.
    pub async fn events(&self) -> Option<mpsc::Receiver<DirectoryEvent>> {
        self.events_rx.lock().await.take()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Directory Actor (owns all mutable state)
// ============================================================================

struct DirectoryActor<N: GossipSubRpc> {
    identity: Identity,
    gossipsub: GossipSub<N>,
    publisher_addrs: Vec<String>,
    config: DirectoryConfig,
    catalog: Catalog,
    /// `Some` exactly while started.
    subscription: Option<Subscription>,
    heartbeat: Option<Interval>,
    cleanup: Option<Interval>,
    events_tx: mpsc::Sender<DirectoryEvent>,
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<ReceivedMessage> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn delayed_interval(period: Duration) -> Interval {
    tokio::time::interval_at(Instant::now() + period, period)
}

impl<N: GossipSubRpc> DirectoryActor<N> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                msg = next_message(&mut self.subscription) => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => {
                            warn!("directory subscription closed; no longer receiving announcements");
                            self.subscription = None;
                        }
                    }
                }
                _ = tick(&mut self.heartbeat) => {
                    self.send_heartbeats().await;
                }
                _ = tick(&mut self.cleanup) => {
                    self.cleanup_stale();
                }
            }
        }
        debug!("directory actor shutting down");
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            Command::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Announce {
                stream_id,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.announce(stream_id, metadata).await);
            }
            Command::Deregister { stream_id, reply } => {
                let _ = reply.send(self.deregister(&stream_id).await);
            }
            Command::Query { filter, reply } => {
                let _ = reply.send(self.query(filter).await);
            }
            Command::Discovered(filter, reply) => {
                let _ = reply.send(self.catalog.discovered(&filter));
            }
            Command::Local(reply) => {
                let _ = reply.send(self.catalog.local());
            }
            Command::Count(reply) => {
                let _ = reply.send(self.catalog.count());
            }
            Command::IsStarted(reply) => {
                let _ = reply.send(self.is_started());
            }
            Command::Quit => {
                self.stop().await;
                return false;
            }
        }
        true
    }

    fn is_started(&self) -> bool {
        self.heartbeat.is_some()
    }

    fn topic(&self) -> String {
        directory_topic(&self.config.namespace)
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        if self.is_started() {
            debug!("stream directory already started");
            return Ok(());
        }
        let subscription = self.gossipsub.subscribe(&self.topic()).await?;
        self.subscription = Some(subscription);
        self.heartbeat = Some(delayed_interval(self.config.heartbeat_interval));
        self.cleanup = Some(delayed_interval(self.config.cleanup_interval));
        info!(
            topic = %self.topic(),
            identity = %self.identity,
            "stream directory started"
        );
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.is_started() {
            return;
        }
        let local: Vec<String> = self.catalog.local.keys().cloned().collect();
        for stream_id in local {
            self.publish(DirectoryMessage::Deregister {
                stream_id,
                publisher: self.identity.to_hex(),
                timestamp: now_ms(),
            })
            .await;
        }

        self.heartbeat = None;
        self.cleanup = None;
        self.subscription = None;
        if let Err(e) = self.gossipsub.unsubscribe(&self.topic()).await {
            debug!(error = %e, "failed to leave directory topic");
        }
        self.catalog.clear();
        info!("stream directory stopped");
    }

    async fn announce(
        &mut self,
        stream_id: String,
        mut metadata: StreamMetadata,
    ) -> anyhow::Result<DirectoryEntry> {
        if !self.is_started() {
            return Err(DirectoryError::NotStarted.into());
        }

        metadata.publisher = Some(self.identity.to_hex());
        if !self.publisher_addrs.is_empty() {
            metadata.publisher_addrs = Some(self.publisher_addrs.clone());
        }
        metadata.timestamp = Some(now_ms());
        metadata.topic = Some(stream_topic(&self.config.namespace, &stream_id));

        let entry = DirectoryEntry {
            stream_id: stream_id.clone(),
            metadata: metadata.clone(),
            publisher: self.identity,
            last_seen: Instant::now(),
            is_local: true,
        };

        let msg = DirectoryMessage::Announce {
            stream_id: stream_id.clone(),
            metadata,
        };
        // Only a stream the network has heard of gets heartbeats.
        self.gossipsub.publish(&self.topic(), msg.encode()).await?;
        self.catalog.insert_local(entry.clone());
        info!(stream_id = %stream_id, "announced stream");
        Ok(entry)
    }

    async fn deregister(&mut self, stream_id: &str) -> anyhow::Result<()> {
        if !self.is_started() {
            return Ok(());
        }
        if self.catalog.remove_local(stream_id).is_none() {
            trace!(stream_id = %stream_id, "deregister of unknown stream ignored");
            return Ok(());
        }
        let msg = DirectoryMessage::Deregister {
            stream_id: stream_id.to_string(),
            publisher: self.identity.to_hex(),
            timestamp: now_ms(),
        };
        self.gossipsub.publish(&self.topic(), msg.encode()).await?;
        info!(stream_id = %stream_id, "deregistered stream");
        Ok(())
    }

    async fn query(&mut self, filter: StreamFilter) -> anyhow::Result<Vec<DirectoryEntry>> {
        if !self.is_started() {
            return Err(DirectoryError::NotStarted.into());
        }
        let now = now_ms();
        let msg = DirectoryMessage::Query {
            filter: filter.clone(),
            request_id: format!("{}-{}", self.identity.to_hex(), now),
            from: self.identity.to_hex(),
            timestamp: now,
        };
        self.gossipsub.publish(&self.topic(), msg.encode()).await?;
        Ok(self.catalog.discovered(&filter))
    }

    /// Best-effort publish for timer-driven and reactive traffic.
    async fn publish(&self, msg: DirectoryMessage) {
        let kind = msg.kind();
        if let Err(e) = self.gossipsub.publish(&self.topic(), msg.encode()).await {
            debug!(kind, error = %e, "directory publish failed");
        }
    }

    async fn handle_message(&mut self, msg: ReceivedMessage) {
        let from = msg.source;
        let message = match DirectoryMessage::decode(&msg.data) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %from.short(), error = %e, "dropping undecodable directory message");
                return;
            }
        };
        trace!(peer = %from.short(), kind = message.kind(), "directory message");

        let now = Instant::now();
        match message {
            DirectoryMessage::Announce {
                stream_id,
                metadata,
            } => {
                self.record_discovered(&stream_id, metadata, from, now);
            }
            DirectoryMessage::Heartbeat { stream_id, .. } => {
                if let Some(publisher) = self.catalog.touch(&stream_id, now) {
                    self.emit(DirectoryEvent::Refreshed {
                        stream_id,
                        publisher,
                    });
                }
            }
            DirectoryMessage::Deregister { stream_id, .. } => {
                if self.catalog.remove_discovered(&stream_id).is_some() {
                    info!(stream_id = %stream_id, peer = %from.short(), "stream deregistered");
                    self.emit(DirectoryEvent::Removed {
                        stream_id,
                        reason: RemovalReason::Deregistered,
                    });
                }
            }
            DirectoryMessage::Query {
                filter, request_id, ..
            } => {
                let streams = self.catalog.matching_local(&filter);
                if streams.is_empty() {
                    return;
                }
                debug!(
                    request_id = %request_id,
                    count = streams.len(),
                    "answering stream query"
                );
                self.publish(DirectoryMessage::Response {
                    request_id,
                    streams,
                    from: self.identity.to_hex(),
                    timestamp: now_ms(),
                })
                .await;
            }
            DirectoryMessage::Response { streams, .. } => {
                for stream in streams {
                    self.record_discovered(&stream.stream_id, stream.metadata, from, now);
                }
            }
        }
    }

    fn record_discovered(
        &mut self,
        stream_id: &str,
        metadata: StreamMetadata,
        publisher: Identity,
        now: Instant,
    ) {
        let (outcome, entry) = self
            .catalog
            .upsert_discovered(stream_id, metadata, publisher, now);
        match outcome {
            Upsert::Inserted => {
                info!(stream_id = %stream_id, peer = %publisher.short(), "discovered stream");
                self.emit(DirectoryEvent::Discovered(entry));
            }
            Upsert::Replaced => {
                self.emit(DirectoryEvent::Refreshed {
                    stream_id: stream_id.to_string(),
                    publisher,
                });
            }
        }
    }

    async fn send_heartbeats(&mut self) {
        let local: Vec<String> = self.catalog.local.keys().cloned().collect();
        if local.is_empty() {
            return;
        }
        trace!(count = local.len(), "sending stream heartbeats");
        for stream_id in local {
            self.publish(DirectoryMessage::Heartbeat {
                stream_id,
                publisher: self.identity.to_hex(),
                timestamp: now_ms(),
            })
            .await;
        }
    }

    fn cleanup_stale(&mut self) {
        let stale = self
            .catalog
            .evict_stale(Instant::now(), self.config.stale_threshold);
        for stream_id in stale {
            info!(stream_id = %stream_id, "removed stale stream");
            self.emit(DirectoryEvent::Removed {
                stream_id,
                reason: RemovalReason::Stale,
            });
        }
    }

    fn emit(&self, event: DirectoryEvent) {
        if self.events_tx.try_send(event).is_err() {
            trace!("directory event dropped: no reader or channel full");
        }
    }
}
