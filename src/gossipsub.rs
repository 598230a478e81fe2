//! # GossipSub Topic Engine
//!
//! Signed, deduplicated publish/subscribe over the overlay.
//!
//! ## Peer Sets
//!
//! For every peer we remember which topics it has announced, so a publish
//! can reach all subscribers of a topic even when this node is not
//! subscribed itself. For topics we *are* subscribed to, subscribers are
//! split into two sets:
//!
//! | Set | Purpose | Message Type |
//! |-----|---------|-------------|
//! | Eager | Forward every message we receive | Full messages |
//! | Lazy | Repair path for missed messages | IHave announcements |
//!
//! ## Message Flow
//!
//! 1. **Publish**: sent to every known subscriber of the topic
//! 2. **Forward**: first receipt is forwarded to eager peers
//! 3. **IHave**: lazy peers receive recent message ids on each heartbeat
//! 4. **IWant**: a peer requests ids it has not seen
//! 5. **Graft / Prune**: keep the eager set between `mesh_n_low` and `mesh_n_high`
//!
//! ## Validation
//!
//! - Message id is recomputed from `source || seqno || data`
//! - Duplicates are dropped by id before anything else
//! - Signatures are domain-separated Ed25519 over source, topic, seqno, data
//! - Per-source sequence window rejects replays that fell out of the cache
//! - Per-peer and local publish rate limits
//!
//! Outbound traffic goes through one sender task per peer, so the actor
//! never waits on the network and messages to a single peer stay ordered.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blake3::hash;
use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto::{PUBSUB_SIGNATURE_DOMAIN, SignatureError, verify_with_domain};
use crate::identity::{Contact, Identity, Keypair, now_ms};
use crate::messages::{GossipSubRequest, MessageId};
use crate::protocols::GossipSubRpc;

// ============================================================================
// Configuration Constants
// ============================================================================

pub const DEFAULT_IHAVE_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 10_000;

pub const DEFAULT_MESSAGE_CACHE_TTL: Duration = Duration::from_secs(120);

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 100;

/// D - target eager peers per topic.
pub const DEFAULT_MESH_N: usize = 6;

/// D_lo - graft lazy peers below this.
pub const DEFAULT_MESH_N_LOW: usize = 4;

/// D_hi - prune eager peers above this.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// D_lazy - lazy peers kept per topic for IHave gossip.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

pub const DEFAULT_PRUNE_BACKOFF_SECS: u64 = 60;

// ============================================================================
// Limits
// ============================================================================

/// Maximum message payload size. Audio chunks must fit with envelope
/// overhead inside one RPC frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Local publishes per second. Sized for a few concurrent audio streams.
pub const DEFAULT_PUBLISH_RATE_LIMIT: usize = 500;

pub const DEFAULT_PER_PEER_RATE_LIMIT: usize = 500;

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

pub const MAX_TOPIC_LENGTH: usize = 256;

pub const MAX_TOPICS: usize = 10_000;

pub const MAX_SUBSCRIPTIONS_PER_PEER: usize = 1_000;

pub const MAX_PEERS_PER_TOPIC: usize = 1_000;

pub const MAX_KNOWN_PEERS: usize = 1_000;

pub const DEFAULT_MAX_IWANT_MESSAGES: usize = 10;

pub const DEFAULT_IWANT_RATE_LIMIT: usize = 5;

pub const MAX_IWANT_RESPONSE_BYTES: usize = 256 * 1024;

/// Queued outbound messages per peer before new ones are dropped.
pub const MAX_OUTBOUND_PER_PEER: usize = 1_024;

pub const MAX_RATE_LIMIT_ENTRIES: usize = 10_000;

pub const MAX_SEQNO_TRACKING_SOURCES: usize = 10_000;

/// Sliding window for out-of-order sequence numbers per source.
pub const SEQNO_WINDOW_SIZE: usize = 256;

/// Hard cap on message cache memory.
pub const MAX_MESSAGE_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Buffered messages per local subscription handle.
pub const SUBSCRIPTION_CHANNEL_SIZE: usize = 1_024;

const MAX_PENDING_IWANTS: usize = 100;

const MAX_GLOBAL_PENDING_IWANTS: usize = 1_000;

const MAX_IWANT_RETRY_PEERS: usize = 10;

const MAX_BACKOFF_ENTRIES: usize = 10_000;

const COMMAND_CHANNEL_SIZE: usize = 1_000;

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

#[derive(Clone, Debug)]
pub struct GossipSubConfig {
    /// D - target number of eager peers per topic.
    pub mesh_n: usize,
    /// D_lo - minimum eager peers before grafting more.
    pub mesh_n_low: usize,
    /// D_hi - maximum eager peers before pruning.
    pub mesh_n_high: usize,
    /// D_lazy - lazy peers to keep for IHave gossip.
    pub gossip_lazy: usize,
    /// How long a pruned peer waits before grafting again.
    pub prune_backoff: Duration,

    pub ihave_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub message_cache_size: usize,
    pub message_cache_ttl: Duration,

    pub max_message_size: usize,
    pub max_ihave_length: usize,
    pub publish_rate_limit: usize,
    pub per_peer_rate_limit: usize,

    /// Deliver our own publishes to our own subscriptions.
    pub emit_self: bool,
    /// Fail a publish with [`MessageRejection::NoPeers`] when nobody would
    /// receive it.
    pub require_peers: bool,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            prune_backoff: Duration::from_secs(DEFAULT_PRUNE_BACKOFF_SECS),

            ihave_timeout: DEFAULT_IHAVE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            message_cache_ttl: DEFAULT_MESSAGE_CACHE_TTL,

            max_message_size: MAX_MESSAGE_SIZE,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            publish_rate_limit: DEFAULT_PUBLISH_RATE_LIMIT,
            per_peer_rate_limit: DEFAULT_PER_PEER_RATE_LIMIT,

            emit_self: false,
            require_peers: false,
        }
    }
}

// ============================================================================
// Message Signing
// ============================================================================

/// source(32) || topic_len(4) || topic || seqno(8) || data_len(4) || data
fn build_signed_payload(source: &Identity, topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
    let topic_bytes = topic.as_bytes();
    let mut payload = Vec::with_capacity(32 + 4 + topic_bytes.len() + 8 + 4 + data.len());

    payload.extend_from_slice(source.as_bytes());
    payload.extend_from_slice(&(topic_bytes.len() as u32).to_le_bytes());
    payload.extend_from_slice(topic_bytes);
    payload.extend_from_slice(&seqno.to_le_bytes());
    payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
    payload.extend_from_slice(data);

    payload
}

fn sign_message(keypair: &Keypair, topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
    let payload = build_signed_payload(&keypair.identity(), topic, seqno, data);
    crate::crypto::sign_with_domain(keypair, PUBSUB_SIGNATURE_DOMAIN, &payload)
}

fn verify_message_signature(
    source: &Identity,
    topic: &str,
    seqno: u64,
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let payload = build_signed_payload(source, topic, seqno, data);
    verify_with_domain(source, PUBSUB_SIGNATURE_DOMAIN, &payload, signature)
}

/// `blake3(source || seqno_le || data)`
pub fn message_id(source: &Identity, seqno: u64, data: &[u8]) -> MessageId {
    let mut input = Vec::with_capacity(32 + 8 + data.len());
    input.extend_from_slice(source.as_bytes());
    input.extend_from_slice(&seqno.to_le_bytes());
    input.extend_from_slice(data);
    *hash(&input).as_bytes()
}

// ============================================================================
// Per-peer bookkeeping
// ============================================================================

#[derive(Clone, Debug, Default)]
struct SeqnoTracker {
    highest_seen: u64,
    recent_seqnos: VecDeque<u64>,
}

impl SeqnoTracker {
    fn check_and_record(&mut self, seqno: u64) -> bool {
        if seqno > self.highest_seen {
            self.highest_seen = seqno;
            self.record_recent(seqno);
            return true;
        }

        if self.recent_seqnos.contains(&seqno) {
            return false;
        }

        if seqno.saturating_add(SEQNO_WINDOW_SIZE as u64) >= self.highest_seen {
            self.record_recent(seqno);
            return true;
        }

        false
    }

    fn record_recent(&mut self, seqno: u64) {
        if self.recent_seqnos.len() >= SEQNO_WINDOW_SIZE {
            self.recent_seqnos.pop_front();
        }
        self.recent_seqnos.push_back(seqno);
    }
}

/// Sliding one-second window counter.
#[derive(Debug, Default)]
struct RateWindow {
    times: VecDeque<Instant>,
}

impl RateWindow {
    /// Returns `true` when the limit is exceeded; the event is then not recorded.
    fn exceeded(&mut self, max_rate: usize) -> bool {
        let now = Instant::now();
        while let Some(front) = self.times.front() {
            if now.duration_since(*front) > RATE_LIMIT_WINDOW {
                self.times.pop_front();
            } else {
                break;
            }
        }

        if self.times.len() >= max_rate {
            return true;
        }
        self.times.push_back(now);
        false
    }
}

#[derive(Debug, Default)]
struct PeerRateLimit {
    publish: RateWindow,
    iwant: RateWindow,
}

#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub topic: String,
    pub source: Identity,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub msg_id: MessageId,
    pub received_at: Instant,
}

#[derive(Clone)]
struct CachedMessage {
    topic: String,
    source: Identity,
    seqno: u64,
    data: Vec<u8>,
    signature: Vec<u8>,
    cached_at: Instant,
}

impl CachedMessage {
    fn size_bytes(&self) -> usize {
        self.topic.len() + self.data.len() + self.signature.len() + 64
    }
}

#[derive(Debug, Clone)]
struct PendingIWant {
    requested_at: Instant,
    tried_peers: Vec<Identity>,
}

#[derive(Debug)]
struct TopicState {
    eager_peers: HashSet<Identity>,
    lazy_peers: HashSet<Identity>,
    recent_messages: VecDeque<MessageId>,
    pending_iwants: LruCache<MessageId, PendingIWant>,
    last_lazy_push: Instant,
}

impl Default for TopicState {
    fn default() -> Self {
        Self {
            eager_peers: HashSet::new(),
            lazy_peers: HashSet::new(),
            recent_messages: VecDeque::new(),
            pending_iwants: LruCache::new(
                NonZeroUsize::new(MAX_PENDING_IWANTS).unwrap_or(NonZeroUsize::MIN),
            ),
            last_lazy_push: Instant::now(),
        }
    }
}

impl TopicState {
    fn total_peers(&self) -> usize {
        self.eager_peers.len() + self.lazy_peers.len()
    }

    fn contains(&self, peer: &Identity) -> bool {
        self.eager_peers.contains(peer) || self.lazy_peers.contains(peer)
    }

    /// Adds as eager while under `eager_target`, lazy otherwise. Returns
    /// `Some(true)` if the peer became eager, `None` if the topic is full.
    fn add_peer(&mut self, peer: Identity, eager_target: usize) -> Option<bool> {
        if self.eager_peers.contains(&peer) {
            return Some(true);
        }
        if self.lazy_peers.contains(&peer) {
            return Some(false);
        }
        if self.total_peers() >= MAX_PEERS_PER_TOPIC {
            return None;
        }
        if self.eager_peers.len() < eager_target {
            self.eager_peers.insert(peer);
            Some(true)
        } else {
            self.lazy_peers.insert(peer);
            Some(false)
        }
    }

    fn promote_to_eager(&mut self, peer: Identity, eager_target: usize) -> bool {
        if self.eager_peers.contains(&peer) {
            return true;
        }
        if self.eager_peers.len() >= eager_target {
            return false;
        }
        self.lazy_peers.remove(&peer);
        self.eager_peers.insert(peer);
        true
    }

    fn demote_to_lazy(&mut self, peer: Identity) {
        if self.eager_peers.remove(&peer) {
            self.lazy_peers.insert(peer);
        }
    }

    fn remove_peer(&mut self, peer: &Identity) {
        self.eager_peers.remove(peer);
        self.lazy_peers.remove(peer);
    }

    fn remember(&mut self, msg_id: MessageId, max_ihave_length: usize) {
        self.recent_messages.push_back(msg_id);
        while self.recent_messages.len() > max_ihave_length {
            self.recent_messages.pop_front();
        }
    }

    fn should_lazy_push(&self, interval: Duration) -> bool {
        self.last_lazy_push.elapsed() >= interval && !self.lazy_peers.is_empty()
    }

    /// Returns `true` when a new pending entry was created.
    fn record_iwant(&mut self, msg_id: MessageId, peer: Identity) -> bool {
        if self.pending_iwants.contains(&msg_id) {
            return false;
        }
        let will_evict = self.pending_iwants.len() >= MAX_PENDING_IWANTS;
        self.pending_iwants.put(
            msg_id,
            PendingIWant {
                requested_at: Instant::now(),
                tried_peers: vec![peer],
            },
        );
        !will_evict
    }

    /// Retries timed-out IWants against another lazy peer. Returns the
    /// retries to send and how many entries were given up on.
    fn check_iwant_timeouts(&mut self, timeout: Duration) -> (Vec<(MessageId, Identity)>, usize) {
        let now = Instant::now();
        let mut retries = Vec::new();
        let mut abandoned = Vec::new();

        let expired: Vec<(MessageId, Vec<Identity>)> = self
            .pending_iwants
            .iter()
            .filter(|(_, p)| now.duration_since(p.requested_at) > timeout)
            .map(|(id, p)| (*id, p.tried_peers.clone()))
            .collect();

        for (msg_id, tried) in expired {
            let next = self
                .lazy_peers
                .iter()
                .chain(self.eager_peers.iter())
                .find(|p| !tried.contains(p))
                .copied();
            match (next, self.pending_iwants.get_mut(&msg_id)) {
                (Some(peer), Some(pending)) if pending.tried_peers.len() < MAX_IWANT_RETRY_PEERS => {
                    pending.tried_peers.push(peer);
                    pending.requested_at = now;
                    retries.push((msg_id, peer));
                }
                _ => abandoned.push(msg_id),
            }
        }

        let count = abandoned.len();
        for msg_id in abandoned {
            self.pending_iwants.pop(&msg_id);
        }
        (retries, count)
    }

    fn message_received(&mut self, msg_id: &MessageId) -> bool {
        self.pending_iwants.pop(msg_id).is_some()
    }
}

/// Why a publish was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRejection {
    MessageTooLarge,
    TopicTooLong,
    InvalidTopic,
    RateLimited,
    /// `require_peers` is set and no peer subscribes to the topic.
    NoPeers,
}

impl std::fmt::Display for MessageRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge => write!(f, "message size exceeds maximum allowed"),
            Self::TopicTooLong => write!(f, "topic name exceeds maximum length"),
            Self::InvalidTopic => {
                write!(f, "topic name is invalid (empty or contains non-ASCII characters)")
            }
            Self::RateLimited => write!(f, "local publish rate limit exceeded"),
            Self::NoPeers => write!(f, "no peers subscribed to topic"),
        }
    }
}

impl std::error::Error for MessageRejection {}

fn validate_topic(topic: &str) -> Result<(), MessageRejection> {
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(MessageRejection::TopicTooLong);
    }
    if !is_valid_topic(topic) {
        return Err(MessageRejection::InvalidTopic);
    }
    Ok(())
}

/// A local subscription to one topic. Dropping it stops delivery to this
/// handle but keeps the node subscribed until [`GossipSub::unsubscribe`].
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<ReceivedMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the topic is unsubscribed.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReceivedMessage> {
        self.receiver.try_recv().ok()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<anyhow::Result<mpsc::Receiver<ReceivedMessage>>>),
    Unsubscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Publish(String, Vec<u8>, oneshot::Sender<anyhow::Result<MessageId>>),
    HandleMessage(Contact, GossipSubRequest, oneshot::Sender<anyhow::Result<()>>),
    AddPeer(Contact),
    RemovePeer(Identity),
    GetSubscriptions(oneshot::Sender<Vec<String>>),
    GetSubscribers(String, oneshot::Sender<Vec<Identity>>),
    Quit,
}

// ============================================================================
// GossipSub Handle (public API - cheap to clone)
// ============================================================================

pub struct GossipSub<N: GossipSubRpc> {
    identity: Identity,
    cmd_tx: mpsc::Sender<Command>,
    _phantom: std::marker::PhantomData<fn() -> N>,
}

impl<N: GossipSubRpc> Clone for GossipSub<N> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity,
            cmd_tx: self.cmd_tx.clone(),
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<N: GossipSubRpc> GossipSub<N> {
    pub fn spawn(network: Arc<N>, keypair: Keypair, config: GossipSubConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let identity = keypair.identity();

        let actor = GossipSubActor::new(network, keypair, config);
        tokio::spawn(actor.run(cmd_rx));

        Self {
            identity,
            cmd_tx,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Subscribe to `topic`. Each call returns an independent handle that
    /// receives every message on the topic.
    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<Subscription> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        let receiver = rx
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))??;
        Ok(Subscription {
            topic: topic.to_string(),
            receiver,
        })
    }

    /// Drop every local handle for `topic` and tell peers we left.
    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> anyhow::Result<MessageId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(topic.to_string(), data, tx))
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetSubscriptions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Remote peers that have announced a subscription to `topic`.
    pub async fn subscribers(&self, topic: &str) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetSubscribers(topic.to_string(), tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Start exchanging messages with a connected peer.
    pub async fn add_peer(&self, contact: Contact) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::AddPeer(contact))
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    pub async fn remove_peer(&self, peer: Identity) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::RemovePeer(peer))
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    /// Handle an incoming request from an authenticated peer.
    pub async fn handle_message(
        &self,
        from: &Contact,
        message: GossipSubRequest,
    ) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::HandleMessage(from.clone(), message, tx))
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?
    }
}

// ============================================================================
// GossipSub Actor (owns state)
// ============================================================================

type BackoffKey = (Identity, String);

struct PeerSender {
    tx: mpsc::Sender<GossipSubRequest>,
    task: JoinHandle<()>,
}

struct GossipSubActor<N: GossipSubRpc> {
    network: Arc<N>,
    keypair: Keypair,
    local_identity: Identity,
    config: GossipSubConfig,
    /// Local subscription handles per topic.
    subscriptions: HashMap<String, Vec<mpsc::Sender<ReceivedMessage>>>,
    /// Eager/lazy sets for topics we are subscribed to.
    topics: HashMap<String, TopicState>,
    /// Topics each remote peer has announced.
    peer_topics: HashMap<Identity, HashSet<String>>,
    contacts: HashMap<Identity, Contact>,
    senders: HashMap<Identity, PeerSender>,
    message_cache: LruCache<MessageId, CachedMessage>,
    message_cache_bytes: usize,
    seqno: u64,
    seqno_tracker: LruCache<Identity, SeqnoTracker>,
    rate_limits: LruCache<Identity, PeerRateLimit>,
    local_rate: RateWindow,
    global_pending_iwants: usize,
    prune_backoff: LruCache<BackoffKey, Instant>,
}

impl<N: GossipSubRpc> GossipSubActor<N> {
    fn new(network: Arc<N>, keypair: Keypair, config: GossipSubConfig) -> Self {
        let cap = |n: usize| NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);
        let local_identity = keypair.identity();

        Self {
            network,
            keypair,
            local_identity,
            message_cache: LruCache::new(cap(config.message_cache_size)),
            config,
            subscriptions: HashMap::new(),
            topics: HashMap::new(),
            peer_topics: HashMap::new(),
            contacts: HashMap::new(),
            senders: HashMap::new(),
            message_cache_bytes: 0,
            // Time-seeded so a restarted node with a persistent key is not
            // mistaken for a replay.
            seqno: now_ms().saturating_mul(1_000),
            seqno_tracker: LruCache::new(cap(MAX_SEQNO_TRACKING_SOURCES)),
            rate_limits: LruCache::new(cap(MAX_RATE_LIMIT_ENTRIES)),
            local_rate: RateWindow::default(),
            global_pending_iwants: 0,
            prune_backoff: LruCache::new(cap(MAX_BACKOFF_ENTRIES)),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat_interval = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_subscribe_cmd(&topic));
                        }
                        Some(Command::Unsubscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_unsubscribe_cmd(&topic));
                        }
                        Some(Command::Publish(topic, data, reply)) => {
                            let _ = reply.send(self.handle_publish_cmd(&topic, data));
                        }
                        Some(Command::HandleMessage(from, msg, reply)) => {
                            let _ = reply.send(self.handle_message_internal(from, msg));
                        }
                        Some(Command::AddPeer(contact)) => {
                            self.add_peer(contact);
                        }
                        Some(Command::RemovePeer(peer)) => {
                            self.remove_peer(&peer);
                        }
                        Some(Command::GetSubscriptions(reply)) => {
                            let _ = reply.send(self.subscriptions.keys().cloned().collect());
                        }
                        Some(Command::GetSubscribers(topic, reply)) => {
                            let _ = reply.send(self.subscribers_of(&topic));
                        }
                        Some(Command::Quit) => {
                            debug!("GossipSub actor quitting");
                            break;
                        }
                        None => {
                            debug!("GossipSub handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = heartbeat_interval.tick() => {
                    self.heartbeat();
                }
            }
        }

        for (_, sender) in self.senders.drain() {
            sender.task.abort();
        }
    }

    // ========================================================================
    // Peers
    // ========================================================================

    fn add_peer(&mut self, contact: Contact) {
        let peer = contact.identity;
        if peer == self.local_identity {
            return;
        }
        let is_new = !self.senders.contains_key(&peer);
        self.store_contact(contact);

        if is_new {
            let topics: Vec<String> = self.subscriptions.keys().cloned().collect();
            for topic in topics {
                self.send(&peer, GossipSubRequest::Subscribe { topic });
            }
            debug!(peer = %peer.short(), "pubsub peer added");
        }
    }

    fn remove_peer(&mut self, peer: &Identity) {
        self.contacts.remove(peer);
        if let Some(sender) = self.senders.remove(peer) {
            sender.task.abort();
        }
        self.peer_topics.remove(peer);
        for state in self.topics.values_mut() {
            state.remove_peer(peer);
        }
        self.rate_limits.pop(peer);
        debug!(peer = %peer.short(), "pubsub peer removed");
    }

    fn store_contact(&mut self, contact: Contact) {
        let peer = contact.identity;
        if !self.contacts.contains_key(&peer) && self.contacts.len() >= MAX_KNOWN_PEERS {
            warn!(peer = %peer.short(), "known peer limit reached, ignoring peer");
            return;
        }
        self.contacts.insert(peer, contact.clone());

        if !self.senders.contains_key(&peer) {
            let (tx, mut rx) = mpsc::channel::<GossipSubRequest>(MAX_OUTBOUND_PER_PEER);
            let network = self.network.clone();
            let task = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = network.send_gossipsub(&contact, msg).await {
                        trace!(peer = %contact.identity.short(), error = %e, "GossipSub send failed");
                    }
                }
            });
            self.senders.insert(peer, PeerSender { tx, task });
        }
    }

    fn send(&self, to: &Identity, message: GossipSubRequest) {
        let Some(sender) = self.senders.get(to) else {
            trace!(peer = %to.short(), "no sender for peer, dropping message");
            return;
        };
        if let Err(e) = sender.tx.try_send(message) {
            debug!(peer = %to.short(), error = %e, "outbound queue full, dropping message");
        }
    }

    fn subscribers_of(&self, topic: &str) -> Vec<Identity> {
        self.peer_topics
            .iter()
            .filter(|(peer, topics)| topics.contains(topic) && self.contacts.contains_key(peer))
            .map(|(peer, _)| *peer)
            .collect()
    }

    // ========================================================================
    // Local commands
    // ========================================================================

    fn handle_subscribe_cmd(
        &mut self,
        topic: &str,
    ) -> anyhow::Result<mpsc::Receiver<ReceivedMessage>> {
        validate_topic(topic)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        if let Some(handlers) = self.subscriptions.get_mut(topic) {
            handlers.retain(|h| !h.is_closed());
            handlers.push(tx);
            return Ok(rx);
        }

        if self.subscriptions.len() >= MAX_TOPICS {
            anyhow::bail!("topic limit reached (max {})", MAX_TOPICS);
        }
        self.subscriptions.insert(topic.to_string(), vec![tx]);

        let mut state = TopicState::default();
        for peer in self.subscribers_of(topic) {
            state.add_peer(peer, self.config.mesh_n);
        }
        let eager: Vec<Identity> = state.eager_peers.iter().copied().collect();
        self.topics.insert(topic.to_string(), state);

        let peers: Vec<Identity> = self.contacts.keys().copied().collect();
        for peer in &peers {
            self.send(peer, GossipSubRequest::Subscribe {
                topic: topic.to_string(),
            });
        }
        for peer in eager {
            self.send(&peer, GossipSubRequest::Graft {
                topic: topic.to_string(),
            });
        }

        debug!(topic = %topic, peers = peers.len(), "subscribed to topic");
        Ok(rx)
    }

    fn handle_unsubscribe_cmd(&mut self, topic: &str) -> anyhow::Result<()> {
        if self.subscriptions.remove(topic).is_none() {
            return Ok(());
        }
        if let Some(state) = self.topics.remove(topic) {
            self.global_pending_iwants = self
                .global_pending_iwants
                .saturating_sub(state.pending_iwants.len());
        }

        let peers: Vec<Identity> = self.contacts.keys().copied().collect();
        for peer in peers {
            self.send(&peer, GossipSubRequest::Unsubscribe {
                topic: topic.to_string(),
            });
        }

        debug!(topic = %topic, "unsubscribed from topic");
        Ok(())
    }

    fn handle_publish_cmd(&mut self, topic: &str, data: Vec<u8>) -> anyhow::Result<MessageId> {
        if data.len() > self.config.max_message_size {
            return Err(MessageRejection::MessageTooLarge.into());
        }
        validate_topic(topic)?;

        let recipients = self.subscribers_of(topic);
        if recipients.is_empty() && self.config.require_peers {
            return Err(MessageRejection::NoPeers.into());
        }

        if self.local_rate.exceeded(self.config.publish_rate_limit) {
            return Err(MessageRejection::RateLimited.into());
        }

        self.seqno = self.seqno.wrapping_add(1);
        let seqno = self.seqno;
        let source = self.local_identity;
        let signature = sign_message(&self.keypair, topic, seqno, &data);
        let msg_id = message_id(&source, seqno, &data);

        self.cache_message(msg_id, CachedMessage {
            topic: topic.to_string(),
            source,
            seqno,
            data: data.clone(),
            signature: signature.clone(),
            cached_at: Instant::now(),
        });
        if let Some(state) = self.topics.get_mut(topic) {
            state.remember(msg_id, self.config.max_ihave_length);
        }

        if self.config.emit_self {
            self.deliver_local(ReceivedMessage {
                topic: topic.to_string(),
                source,
                seqno,
                data: data.clone(),
                msg_id,
                received_at: Instant::now(),
            });
        }

        let publish_msg = GossipSubRequest::Publish {
            topic: topic.to_string(),
            msg_id,
            source,
            seqno,
            data,
            signature,
        };
        for peer in &recipients {
            self.send(peer, publish_msg.clone());
        }

        trace!(
            topic = %topic,
            msg_id = %hex::encode(&msg_id[..8]),
            recipients = recipients.len(),
            "published message"
        );

        Ok(msg_id)
    }

    fn deliver_local(&mut self, message: ReceivedMessage) {
        let Some(handlers) = self.subscriptions.get_mut(&message.topic) else {
            return;
        };
        handlers.retain(|h| !h.is_closed());
        for handler in handlers.iter() {
            if let Err(e) = handler.try_send(message.clone()) {
                warn!(topic = %message.topic, error = %e, "subscriber lagging, dropping message");
            }
        }
    }

    // ========================================================================
    // Remote requests
    // ========================================================================

    fn handle_message_internal(
        &mut self,
        from: Contact,
        msg: GossipSubRequest,
    ) -> anyhow::Result<()> {
        if let Some(topic) = msg.topic()
            && !is_valid_topic(topic)
        {
            anyhow::bail!("invalid topic name from peer");
        }

        let peer = from.identity;
        if !self.contacts.contains_key(&peer) {
            self.store_contact(from);
        }

        match msg {
            GossipSubRequest::Subscribe { topic } => self.handle_subscribe(&peer, &topic),
            GossipSubRequest::Unsubscribe { topic } => self.handle_unsubscribe(&peer, &topic),
            GossipSubRequest::Graft { topic } => self.handle_graft(&peer, &topic),
            GossipSubRequest::Prune {
                topic,
                backoff_secs,
            } => self.handle_prune(&peer, &topic, backoff_secs),
            GossipSubRequest::Publish {
                topic,
                msg_id,
                source,
                seqno,
                data,
                signature,
            } => self.handle_publish(&peer, topic, msg_id, source, seqno, data, signature),
            GossipSubRequest::IHave { topic, msg_ids } => self.handle_ihave(&peer, &topic, msg_ids),
            GossipSubRequest::IWant { msg_ids } => self.handle_iwant(&peer, msg_ids),
        }
        Ok(())
    }

    fn handle_subscribe(&mut self, from: &Identity, topic: &str) {
        let topics = self.peer_topics.entry(*from).or_default();
        if !topics.contains(topic) {
            if topics.len() >= MAX_SUBSCRIPTIONS_PER_PEER {
                debug!(peer = %from.short(), "peer subscription limit reached");
                return;
            }
            topics.insert(topic.to_string());
            trace!(peer = %from.short(), topic = %topic, "peer subscribed");
        }

        let in_backoff = self.is_in_backoff(from, topic);
        let mesh_n = self.config.mesh_n;
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        if state.contains(from) {
            return;
        }
        let target = if in_backoff { 0 } else { mesh_n };
        if state.add_peer(*from, target) == Some(true) {
            self.send(from, GossipSubRequest::Graft {
                topic: topic.to_string(),
            });
        }
    }

    fn handle_unsubscribe(&mut self, from: &Identity, topic: &str) {
        if let Some(topics) = self.peer_topics.get_mut(from) {
            topics.remove(topic);
        }
        if let Some(state) = self.topics.get_mut(topic) {
            state.remove_peer(from);
        }
        trace!(peer = %from.short(), topic = %topic, "peer unsubscribed");
    }

    fn handle_graft(&mut self, from: &Identity, topic: &str) {
        let Some(state) = self.topics.get_mut(topic) else {
            self.send(from, GossipSubRequest::Prune {
                topic: topic.to_string(),
                backoff_secs: None,
            });
            return;
        };

        if state.promote_to_eager(*from, self.config.mesh_n_high) {
            let topics = self.peer_topics.entry(*from).or_default();
            if topics.len() < MAX_SUBSCRIPTIONS_PER_PEER {
                topics.insert(topic.to_string());
            }
            trace!(peer = %from.short(), topic = %topic, "peer grafted");
        } else {
            state.add_peer(*from, 0);
            self.send(from, GossipSubRequest::Prune {
                topic: topic.to_string(),
                backoff_secs: Some(self.config.prune_backoff.as_secs()),
            });
        }
    }

    fn handle_prune(&mut self, from: &Identity, topic: &str, backoff_secs: Option<u64>) {
        if let Some(state) = self.topics.get_mut(topic) {
            state.demote_to_lazy(*from);
        }
        self.record_backoff(from, topic, backoff_secs);
        trace!(peer = %from.short(), topic = %topic, "peer pruned us");
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_publish(
        &mut self,
        from: &Identity,
        topic: String,
        msg_id: MessageId,
        source: Identity,
        seqno: u64,
        data: Vec<u8>,
        signature: Vec<u8>,
    ) {
        if data.len() > self.config.max_message_size {
            debug!(from = %from.short(), "rejecting oversized message");
            return;
        }

        if message_id(&source, seqno, &data) != msg_id {
            debug!(from = %from.short(), "rejecting message with mismatched id");
            return;
        }

        if self.message_cache.contains(&msg_id) {
            trace!(msg_id = %hex::encode(&msg_id[..8]), from = %from.short(), "duplicate message");
            return;
        }

        if source == self.local_identity {
            return;
        }

        if let Err(e) = verify_message_signature(&source, &topic, seqno, &data, &signature) {
            debug!(from = %from.short(), error = %e, "rejecting message with invalid signature");
            return;
        }

        if !self
            .seqno_tracker
            .get_or_insert_mut(source, SeqnoTracker::default)
            .check_and_record(seqno)
        {
            debug!(
                from = %from.short(),
                source = %source.short(),
                seqno = seqno,
                "rejecting replayed message"
            );
            return;
        }

        if self
            .rate_limits
            .get_or_insert_mut(*from, PeerRateLimit::default)
            .publish
            .exceeded(self.config.per_peer_rate_limit)
        {
            debug!(from = %from.short(), "peer rate limited");
            return;
        }

        self.cache_message(msg_id, CachedMessage {
            topic: topic.clone(),
            source,
            seqno,
            data: data.clone(),
            signature: signature.clone(),
            cached_at: Instant::now(),
        });

        let Some(state) = self.topics.get_mut(&topic) else {
            trace!(topic = %topic, "message for topic we do not follow");
            return;
        };
        if state.message_received(&msg_id) {
            self.global_pending_iwants = self.global_pending_iwants.saturating_sub(1);
        }
        state.remember(msg_id, self.config.max_ihave_length);
        let forward_to: Vec<Identity> = state
            .eager_peers
            .iter()
            .filter(|p| **p != *from && **p != source)
            .copied()
            .collect();

        self.deliver_local(ReceivedMessage {
            topic: topic.clone(),
            source,
            seqno,
            data: data.clone(),
            msg_id,
            received_at: Instant::now(),
        });

        let forward_msg = GossipSubRequest::Publish {
            topic,
            msg_id,
            source,
            seqno,
            data,
            signature,
        };
        for peer in &forward_to {
            self.send(peer, forward_msg.clone());
        }

        trace!(
            msg_id = %hex::encode(&msg_id[..8]),
            forwarded = forward_to.len(),
            "handled publish"
        );
    }

    fn handle_ihave(&mut self, from: &Identity, topic: &str, msg_ids: Vec<MessageId>) {
        let missing: Vec<MessageId> = msg_ids
            .into_iter()
            .take(self.config.max_ihave_length)
            .filter(|id| !self.message_cache.contains(id))
            .collect();
        if missing.is_empty() {
            return;
        }

        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        let mut requested = Vec::with_capacity(missing.len());
        for msg_id in missing {
            if self.global_pending_iwants >= MAX_GLOBAL_PENDING_IWANTS {
                debug!("global pending IWant limit reached");
                break;
            }
            if state.record_iwant(msg_id, *from) {
                self.global_pending_iwants += 1;
            }
            requested.push(msg_id);
        }
        if requested.is_empty() {
            return;
        }

        debug!(
            from = %from.short(),
            topic = %topic,
            missing = requested.len(),
            "IHave received, requesting missing messages"
        );
        self.send(from, GossipSubRequest::IWant { msg_ids: requested });
    }

    fn handle_iwant(&mut self, from: &Identity, msg_ids: Vec<MessageId>) {
        if msg_ids.len() > DEFAULT_MAX_IWANT_MESSAGES * 2 {
            warn!(peer = %from.short(), count = msg_ids.len(), "IWant request too large");
            return;
        }
        if self
            .rate_limits
            .get_or_insert_mut(*from, PeerRateLimit::default)
            .iwant
            .exceeded(DEFAULT_IWANT_RATE_LIMIT)
        {
            warn!(peer = %from.short(), "IWant rate limited");
            return;
        }

        let mut bytes_sent = 0usize;
        let mut replies = Vec::new();
        for msg_id in msg_ids.into_iter().take(DEFAULT_MAX_IWANT_MESSAGES) {
            if let Some(cached) = self.message_cache.peek(&msg_id) {
                if bytes_sent.saturating_add(cached.data.len()) > MAX_IWANT_RESPONSE_BYTES {
                    break;
                }
                bytes_sent = bytes_sent.saturating_add(cached.data.len());
                replies.push(GossipSubRequest::Publish {
                    topic: cached.topic.clone(),
                    msg_id,
                    source: cached.source,
                    seqno: cached.seqno,
                    data: cached.data.clone(),
                    signature: cached.signature.clone(),
                });
            }
        }
        for reply in replies {
            self.send(from, reply);
        }
    }

    // ========================================================================
    // Cache and backoff
    // ========================================================================

    fn cache_message(&mut self, msg_id: MessageId, message: CachedMessage) {
        let size = message.size_bytes();

        if let Some(existing) = self.message_cache.pop(&msg_id) {
            self.message_cache_bytes = self.message_cache_bytes.saturating_sub(existing.size_bytes());
        }
        while self.message_cache_bytes + size > MAX_MESSAGE_CACHE_BYTES {
            let Some((_, evicted)) = self.message_cache.pop_lru() else {
                break;
            };
            self.message_cache_bytes = self.message_cache_bytes.saturating_sub(evicted.size_bytes());
        }

        if let Some((_, evicted)) = self.message_cache.push(msg_id, message) {
            self.message_cache_bytes = self.message_cache_bytes.saturating_sub(evicted.size_bytes());
        }
        self.message_cache_bytes = self.message_cache_bytes.saturating_add(size);
    }

    fn evict_expired_cache_entries(&mut self) {
        let ttl = self.config.message_cache_ttl;
        let expired: Vec<MessageId> = self
            .message_cache
            .iter()
            .filter(|(_, cached)| cached.cached_at.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();

        for msg_id in &expired {
            if let Some(evicted) = self.message_cache.pop(msg_id) {
                self.message_cache_bytes = self.message_cache_bytes.saturating_sub(evicted.size_bytes());
            }
        }
        if !expired.is_empty() {
            trace!(
                evicted = expired.len(),
                cache_bytes = self.message_cache_bytes,
                "evicted expired messages from cache"
            );
        }
    }

    fn record_backoff(&mut self, peer: &Identity, topic: &str, backoff_secs: Option<u64>) {
        let backoff = backoff_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.prune_backoff);
        self.prune_backoff
            .put((*peer, topic.to_string()), Instant::now() + backoff);
    }

    fn is_in_backoff(&mut self, peer: &Identity, topic: &str) -> bool {
        let key = (*peer, topic.to_string());
        match self.prune_backoff.get(&key) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                self.prune_backoff.pop(&key);
                false
            }
            None => false,
        }
    }

    fn cleanup_backoff(&mut self) {
        let now = Instant::now();
        let expired: Vec<BackoffKey> = self
            .prune_backoff
            .iter()
            .filter(|(_, expiry)| now >= **expiry)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.prune_backoff.pop(&key);
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn heartbeat(&mut self) {
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        for topic in topics {
            self.mesh_maintenance(&topic);
            self.lazy_push(&topic);
            self.check_timeouts(&topic);
        }

        for handlers in self.subscriptions.values_mut() {
            handlers.retain(|h| !h.is_closed());
        }
        self.cleanup_backoff();
        self.evict_expired_cache_entries();
    }

    fn mesh_maintenance(&mut self, topic: &str) {
        let Some(state) = self.topics.get(topic) else {
            return;
        };
        let eager: Vec<Identity> = state.eager_peers.iter().copied().collect();
        let lazy: Vec<Identity> = state.lazy_peers.iter().copied().collect();

        let mut grafts = Vec::new();
        let mut prunes = Vec::new();

        if eager.len() < self.config.mesh_n_low {
            let mut candidates: Vec<Identity> = lazy
                .into_iter()
                .filter(|p| !self.is_in_backoff(p, topic))
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            let needed = self.config.mesh_n.saturating_sub(eager.len());
            grafts.extend(candidates.into_iter().take(needed));
        } else if eager.len() > self.config.mesh_n_high {
            let mut excess = eager;
            excess.shuffle(&mut rand::thread_rng());
            let keep = self.config.mesh_n;
            prunes.extend(excess.into_iter().skip(keep));
        }

        if let Some(state) = self.topics.get_mut(topic) {
            for peer in &grafts {
                state.promote_to_eager(*peer, usize::MAX);
            }
            for peer in &prunes {
                state.demote_to_lazy(*peer);
            }
            // Keep the lazy set bounded to what gossip needs.
            if state.lazy_peers.len() > self.config.gossip_lazy * 4 {
                let drop: Vec<Identity> = state
                    .lazy_peers
                    .iter()
                    .skip(self.config.gossip_lazy * 4)
                    .copied()
                    .collect();
                for peer in drop {
                    state.lazy_peers.remove(&peer);
                }
            }
        }

        for peer in grafts {
            self.send(&peer, GossipSubRequest::Graft {
                topic: topic.to_string(),
            });
        }
        for peer in prunes {
            self.send(&peer, GossipSubRequest::Prune {
                topic: topic.to_string(),
                backoff_secs: Some(self.config.prune_backoff.as_secs()),
            });
        }
    }

    fn lazy_push(&mut self, topic: &str) {
        let interval = self.config.heartbeat_interval;
        let gossip_lazy = self.config.gossip_lazy;
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        if !state.should_lazy_push(interval) || state.recent_messages.is_empty() {
            return;
        }
        state.last_lazy_push = Instant::now();

        let msg_ids: Vec<MessageId> = state.recent_messages.iter().copied().collect();
        let mut peers: Vec<Identity> = state.lazy_peers.iter().copied().collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(gossip_lazy);

        let ihave = GossipSubRequest::IHave {
            topic: topic.to_string(),
            msg_ids,
        };
        for peer in peers {
            self.send(&peer, ihave.clone());
        }
    }

    fn check_timeouts(&mut self, topic: &str) {
        let timeout = self.config.ihave_timeout;
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        let (retries, abandoned) = state.check_iwant_timeouts(timeout);
        self.global_pending_iwants = self.global_pending_iwants.saturating_sub(abandoned);

        for (msg_id, peer) in retries {
            trace!(
                msg_id = %hex::encode(&msg_id[..8]),
                peer = %peer.short(),
                "retrying IWant with another peer"
            );
            self.send(&peer, GossipSubRequest::IWant {
                msg_ids: vec![msg_id],
            });
        }
    }
}
