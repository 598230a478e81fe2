//! # Overlay Transport
//!
//! Authenticated QUIC overlay that keeps the node connected to its peers.
//!
//! - Binds the first usable listen address
//! - Dials configured bootstrap peers and re-dials them periodically
//! - Learns further peers through `Hello` exchanges and dials those too
//! - Tracks live connections and reports connect/disconnect as [`PeerEvent`]s
//! - Registers every live peer with the pub/sub engine
//!
//! A bootstrap peer is written `IP:PORT/IDENTITY_HEX`. The identity is
//! required because TLS verification is by identity, not by CA.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use lru::LruCache;
use quinn::{Connection, Endpoint};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::crypto::{create_client_config, create_server_config, generate_ed25519_cert};
use crate::gossipsub::GossipSub;
use crate::identity::{Contact, Identity, Keypair};
use crate::protocols::PeerExchangeRpc;
use crate::rpc::{self, DEFAULT_DIAL_TIMEOUT, RpcNode};

pub const DEFAULT_BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_MAX_PEERS: usize = 64;

/// Contacts included in a `Hello` reply.
pub const MAX_EXCHANGED_PEERS: usize = 32;

const MAX_DISCOVERED_CONTACTS: usize = 1_000;

const OVERLAY_COMMAND_CHANNEL_SIZE: usize = 256;

const PEER_EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct BindError {
    pub attempted: Vec<SocketAddr>,
    pub last_error: String,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempted.is_empty() {
            write!(f, "no listen addresses configured")
        } else {
            write!(
                f,
                "could not bind any of {:?}: {}",
                self.attempted, self.last_error
            )
        }
    }
}

impl std::error::Error for BindError {}

#[derive(Debug, Clone)]
pub enum DialError {
    Timeout { addr: String, after: Duration },
    Failed { addr: String, reason: String },
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::Timeout { addr, after } => {
                write!(f, "dial to {} timed out after {:?}", addr, after)
            }
            DialError::Failed { addr, reason } => write!(f, "dial to {} failed: {}", addr, reason),
        }
    }
}

impl std::error::Error for DialError {}

/// A well-known peer to join the overlay through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub addr: SocketAddr,
    pub identity: Identity,
}

impl BootstrapPeer {
    pub fn contact(&self) -> Contact {
        Contact::single(self.identity, self.addr.to_string())
    }
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, identity) = s
            .rsplit_once('/')
            .context("bootstrap peer must be IP:PORT/IDENTITY")?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid bootstrap address: {}", addr))?;
        let identity = Identity::from_hex(identity)
            .map_err(|e| anyhow::anyhow!("invalid bootstrap identity: {}", e))?;
        Ok(Self { addr, identity })
    }
}

impl fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.identity)
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Tried in order; the first that binds wins.
    pub listen_addrs: Vec<SocketAddr>,
    pub bootstrap: Vec<BootstrapPeer>,
    pub bootstrap_interval: Duration,
    pub dial_timeout: Duration,
    /// Discovered (non-bootstrap) peers are only dialed below this count.
    pub max_peers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![SocketAddr::from(([0, 0, 0, 0], 0))],
            bootstrap: Vec::new(),
            bootstrap_interval: DEFAULT_BOOTSTRAP_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_peers: DEFAULT_MAX_PEERS,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected { peer: Identity, addr: String },
    Disconnected { peer: Identity },
    Discovered { peer: Identity },
}

enum OverlayCommand {
    Serve {
        gossipsub: GossipSub<RpcNode>,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        contact: Contact,
        reply: oneshot::Sender<Result<()>>,
    },
    PeerConnected {
        contact: Contact,
        connection: Connection,
    },
    DialFinished {
        contact: Contact,
        outcome: Result<(Connection, Vec<Contact>)>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    ConnectionClosed {
        peer: Identity,
        stable_id: usize,
    },
    Hello {
        from: Contact,
        listen_addrs: Vec<String>,
        reply: oneshot::Sender<Vec<Contact>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<Contact>>,
    },
    Quit {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the overlay actor.
#[derive(Clone)]
pub struct Overlay {
    identity: Identity,
    local_addr: SocketAddr,
    rpcnode: RpcNode,
    cmd_tx: mpsc::Sender<OverlayCommand>,
    events_rx: Arc<Mutex<Option<mpsc::Receiver<PeerEvent>>>>,
}

impl Overlay {
    pub async fn start(keypair: &Keypair, config: TransportConfig) -> Result<Self> {
        let identity = keypair.identity();

        let (server_certs, server_key) = generate_ed25519_cert(keypair)?;
        let (client_certs, client_key) = generate_ed25519_cert(keypair)?;
        let server_config = create_server_config(server_certs, server_key)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let mut last_error = String::new();
        let mut bound = None;
        for addr in &config.listen_addrs {
            match Endpoint::server(server_config.clone(), *addr) {
                Ok(endpoint) => {
                    bound = Some(endpoint);
                    break;
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "failed to bind listen address");
                    last_error = e.to_string();
                }
            }
        }
        let Some(endpoint) = bound else {
            return Err(BindError {
                attempted: config.listen_addrs.clone(),
                last_error,
            }
            .into());
        };
        let local_addr = endpoint.local_addr()?;

        let rpcnode = RpcNode::new(endpoint.clone(), client_config, config.dial_timeout);

        let (cmd_tx, cmd_rx) = mpsc::channel(OVERLAY_COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(PEER_EVENT_CHANNEL_SIZE);

        let actor = OverlayActor::new(
            identity,
            local_addr,
            endpoint,
            rpcnode.clone(),
            config,
            cmd_tx.downgrade(),
            events_tx,
        );
        tokio::spawn(actor.run(cmd_rx));

        info!("Overlay {}/{}", local_addr, identity);

        Ok(Self {
            identity,
            local_addr,
            rpcnode,
            cmd_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Addresses worth telling other peers about. A wildcard bind has none;
    /// peers then fall back to the address they observed.
    pub fn advertised_addrs(&self) -> Vec<String> {
        advertised_addrs(self.local_addr)
    }

    pub fn rpc(&self) -> &RpcNode {
        &self.rpcnode
    }

    /// Start accepting connections and dialing bootstrap peers.
    pub async fn serve(&self, gossipsub: GossipSub<RpcNode>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(OverlayCommand::Serve {
                gossipsub,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("overlay actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("overlay actor closed"))?
    }

    /// Dial `contact` now and keep re-dialing it on every bootstrap round.
    /// Resolves once the peer is registered with pub/sub.
    pub async fn connect(&self, contact: Contact) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(OverlayCommand::Connect {
                contact,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("overlay actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("overlay actor closed"))?
    }

    pub async fn connected_peers(&self) -> Vec<Identity> {
        self.connected_contacts()
            .await
            .into_iter()
            .map(|c| c.identity)
            .collect()
    }

    pub async fn connected_contacts(&self) -> Vec<Contact> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(OverlayCommand::ConnectedPeers { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Take the peer event stream. Returns `None` after the first call.
    pub async fn events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Close all connections and stop the accept loop. Idempotent.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(OverlayCommand::Quit { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    pub(crate) async fn peer_connected(&self, contact: Contact, connection: Connection) {
        let _ = self
            .cmd_tx
            .send(OverlayCommand::PeerConnected {
                contact,
                connection,
            })
            .await;
    }

    pub(crate) async fn handle_hello(
        &self,
        from: Contact,
        listen_addrs: Vec<String>,
    ) -> Result<Vec<Contact>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(OverlayCommand::Hello {
                from,
                listen_addrs,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("overlay actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("overlay actor closed"))
    }
}

fn advertised_addrs(local_addr: SocketAddr) -> Vec<String> {
    if local_addr.ip().is_unspecified() {
        Vec::new()
    } else {
        vec![local_addr.to_string()]
    }
}

struct PeerEntry {
    contact: Contact,
    /// Stable ids of every live connection to this peer. The peer is gone
    /// once the set is empty.
    connections: HashSet<usize>,
    connected_at: Instant,
}

struct OverlayActor {
    identity: Identity,
    local_addr: SocketAddr,
    endpoint: Endpoint,
    rpcnode: RpcNode,
    config: TransportConfig,
    cmd_tx: mpsc::WeakSender<OverlayCommand>,
    events_tx: mpsc::Sender<PeerEvent>,
    peers: HashMap<Identity, PeerEntry>,
    /// Contacts learned from `Hello` replies and inbound peers.
    discovered: LruCache<Identity, Contact>,
    /// Bootstrap peers plus anything passed to `connect`; re-dialed forever.
    persistent: HashMap<Identity, Contact>,
    dialing: HashSet<Identity>,
    gossipsub: Option<GossipSub<RpcNode>>,
    listener: Option<JoinHandle<()>>,
}

impl OverlayActor {
    fn new(
        identity: Identity,
        local_addr: SocketAddr,
        endpoint: Endpoint,
        rpcnode: RpcNode,
        config: TransportConfig,
        cmd_tx: mpsc::WeakSender<OverlayCommand>,
        events_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        let persistent = config
            .bootstrap
            .iter()
            .filter(|b| b.identity != identity)
            .map(|b| (b.identity, b.contact()))
            .collect();
        let capacity = NonZeroUsize::new(MAX_DISCOVERED_CONTACTS).unwrap_or(NonZeroUsize::MIN);

        Self {
            identity,
            local_addr,
            endpoint,
            rpcnode,
            config,
            cmd_tx,
            events_tx,
            peers: HashMap::new(),
            discovered: LruCache::new(capacity),
            persistent,
            dialing: HashSet::new(),
            gossipsub: None,
            listener: None,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<OverlayCommand>) {
        let mut bootstrap_interval = tokio::time::interval(self.config.bootstrap_interval);
        bootstrap_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        bootstrap_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(OverlayCommand::Quit { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                _ = bootstrap_interval.tick() => {
                    self.dial_missing();
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: OverlayCommand) {
        match cmd {
            OverlayCommand::Serve { gossipsub, reply } => {
                if self.gossipsub.is_some() {
                    let _ = reply.send(Err(anyhow::anyhow!("overlay already serving")));
                    return;
                }
                self.spawn_listener(gossipsub.clone());
                self.gossipsub = Some(gossipsub);
                self.dial_missing();
                let _ = reply.send(Ok(()));
            }
            OverlayCommand::Connect { contact, reply } => {
                if contact.identity == self.identity {
                    let _ = reply.send(Err(anyhow::anyhow!("refusing to connect to self")));
                    return;
                }
                self.persistent.insert(contact.identity, contact.clone());
                if self.peers.contains_key(&contact.identity) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.spawn_dial(contact, Some(reply));
            }
            OverlayCommand::PeerConnected {
                contact,
                connection,
            } => {
                self.register_connection(contact, connection).await;
            }
            OverlayCommand::DialFinished {
                contact,
                outcome,
                reply,
            } => {
                self.dialing.remove(&contact.identity);
                match outcome {
                    Ok((connection, learned)) => {
                        self.register_connection(contact, connection).await;
                        self.absorb_contacts(learned);
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        debug!(peer = %contact.identity.short(), error = %e, "dial failed");
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
            OverlayCommand::ConnectionClosed { peer, stable_id } => {
                self.connection_closed(peer, stable_id).await;
            }
            OverlayCommand::Hello {
                from,
                listen_addrs,
                reply,
            } => {
                let _ = reply.send(self.handle_hello(from, listen_addrs));
            }
            OverlayCommand::ConnectedPeers { reply } => {
                let peers = self.peers.values().map(|p| p.contact.clone()).collect();
                let _ = reply.send(peers);
            }
            OverlayCommand::Quit { .. } => {}
        }
    }

    fn spawn_listener(&mut self, gossipsub: GossipSub<RpcNode>) {
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return;
        };
        let overlay = Overlay {
            identity: self.identity,
            local_addr: self.local_addr,
            rpcnode: self.rpcnode.clone(),
            cmd_tx,
            events_rx: Arc::new(Mutex::new(None)),
        };
        let endpoint = self.endpoint.clone();

        self.listener = Some(tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let overlay = overlay.clone();
                let gossipsub = gossipsub.clone();
                tokio::spawn(async move {
                    if let Err(e) = rpc::handle_connection(overlay, gossipsub, incoming).await {
                        debug!("connection error: {:?}", e);
                    }
                });
            }
        }));
    }

    /// Dial every persistent and discovered contact we are not connected to.
    fn dial_missing(&mut self) {
        if self.gossipsub.is_none() {
            return;
        }

        let persistent: Vec<Contact> = self.persistent.values().cloned().collect();
        for contact in persistent {
            if !self.peers.contains_key(&contact.identity) && !self.dialing.contains(&contact.identity)
            {
                self.spawn_dial(contact, None);
            }
        }

        let discovered: Vec<Contact> = self.discovered.iter().map(|(_, c)| c.clone()).collect();
        for contact in discovered {
            if self.peers.len() + self.dialing.len() >= self.config.max_peers {
                break;
            }
            if !self.peers.contains_key(&contact.identity) && !self.dialing.contains(&contact.identity)
            {
                self.spawn_dial(contact, None);
            }
        }
    }

    fn spawn_dial(&mut self, contact: Contact, reply: Option<oneshot::Sender<Result<()>>>) {
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return;
        };
        self.dialing.insert(contact.identity);

        let rpcnode = self.rpcnode.clone();
        let listen_addrs = advertised_addrs(self.local_addr);
        trace!(peer = %contact.identity.short(), addrs = ?contact.addrs, "dialing");

        tokio::spawn(async move {
            let outcome = dial_and_hello(&rpcnode, &contact, listen_addrs).await;
            let _ = cmd_tx
                .send(OverlayCommand::DialFinished {
                    contact,
                    outcome,
                    reply,
                })
                .await;
        });
    }

    async fn register_connection(&mut self, contact: Contact, connection: Connection) {
        let peer = contact.identity;
        if peer == self.identity {
            return;
        }
        let stable_id = connection.stable_id();

        self.rpcnode.register(peer, connection.clone()).await;

        if let Some(cmd_tx) = self.cmd_tx.upgrade() {
            let watched = connection.clone();
            tokio::spawn(async move {
                watched.closed().await;
                let _ = cmd_tx
                    .send(OverlayCommand::ConnectionClosed { peer, stable_id })
                    .await;
            });
        }

        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.connections.insert(stable_id);
            return;
        }

        let addr = connection.remote_address().to_string();
        self.peers.insert(
            peer,
            PeerEntry {
                contact: contact.clone(),
                connections: HashSet::from([stable_id]),
                connected_at: Instant::now(),
            },
        );
        info!(peer = %peer.short(), addr = %addr, peers = self.peers.len(), "peer connected");
        self.emit(PeerEvent::Connected { peer, addr });

        if let Some(gossipsub) = &self.gossipsub
            && let Err(e) = gossipsub.add_peer(contact).await
        {
            warn!(peer = %peer.short(), error = %e, "failed to register peer with pubsub");
        }
    }

    async fn connection_closed(&mut self, peer: Identity, stable_id: usize) {
        let Some(entry) = self.peers.get_mut(&peer) else {
            return;
        };
        entry.connections.remove(&stable_id);
        if !entry.connections.is_empty() {
            self.rpcnode.invalidate(&peer).await;
            return;
        }

        let lifetime = self
            .peers
            .remove(&peer)
            .map(|e| e.connected_at.elapsed())
            .unwrap_or_default();
        info!(peer = %peer.short(), after = ?lifetime, "peer disconnected");

        self.rpcnode.invalidate(&peer).await;
        if let Some(gossipsub) = &self.gossipsub
            && let Err(e) = gossipsub.remove_peer(peer).await
        {
            debug!(peer = %peer.short(), error = %e, "failed to remove peer from pubsub");
        }
        self.emit(PeerEvent::Disconnected { peer });
    }

    fn handle_hello(&mut self, from: Contact, listen_addrs: Vec<String>) -> Vec<Contact> {
        let mut addrs = from.addrs.clone();
        for addr in listen_addrs.into_iter().take(8) {
            if !addr.is_empty() && addr.len() <= 256 && !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        let contact = Contact::new(from.identity, addrs);

        if let Some(entry) = self.peers.get_mut(&from.identity) {
            entry.contact = contact.clone();
        }
        if self.discovered.put(from.identity, contact).is_none() {
            self.emit(PeerEvent::Discovered {
                peer: from.identity,
            });
        }

        self.peers
            .values()
            .filter(|p| p.contact.identity != from.identity)
            .take(MAX_EXCHANGED_PEERS)
            .map(|p| p.contact.clone())
            .collect()
    }

    fn absorb_contacts(&mut self, contacts: Vec<Contact>) {
        let mut fresh = false;
        for contact in contacts {
            if contact.identity == self.identity {
                continue;
            }
            if self.discovered.put(contact.identity, contact.clone()).is_none()
                && !self.peers.contains_key(&contact.identity)
            {
                debug!(peer = %contact.identity.short(), "discovered peer");
                self.emit(PeerEvent::Discovered {
                    peer: contact.identity,
                });
                fresh = true;
            }
        }
        if fresh {
            self.dial_missing();
        }
    }

    fn emit(&self, event: PeerEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("dropping peer event: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.endpoint.close(0u32.into(), b"shutdown");
        self.rpcnode.quit().await;
        self.peers.clear();
        self.dialing.clear();
        debug!("overlay stopped");
    }
}

async fn dial_and_hello(
    rpcnode: &RpcNode,
    contact: &Contact,
    listen_addrs: Vec<String>,
) -> Result<(Connection, Vec<Contact>)> {
    let connection = rpcnode.connect(contact).await?;
    let learned = match rpcnode.hello(contact, listen_addrs).await {
        Ok(peers) => peers,
        Err(e) => {
            debug!(peer = %contact.identity.short(), error = %e, "hello failed");
            Vec::new()
        }
    };
    Ok((connection, learned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_peer_parses_addr_and_identity() {
        let id = Keypair::generate().identity();
        let peer: BootstrapPeer = format!("127.0.0.1:9000/{}", id).parse().unwrap();

        assert_eq!(peer.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(peer.identity, id);
        assert_eq!(peer.to_string(), format!("127.0.0.1:9000/{}", id));
    }

    #[test]
    fn bootstrap_peer_accepts_ipv6() {
        let id = Keypair::generate().identity();
        let peer: BootstrapPeer = format!("[::1]:4000/{}", id).parse().unwrap();
        assert_eq!(peer.addr.port(), 4000);
    }

    #[test]
    fn bootstrap_peer_rejects_malformed_input() {
        assert!("127.0.0.1:9000".parse::<BootstrapPeer>().is_err());
        assert!("127.0.0.1:9000/nothex".parse::<BootstrapPeer>().is_err());
        assert!("not-an-addr/00".parse::<BootstrapPeer>().is_err());
    }

    #[test]
    fn wildcard_bind_advertises_nothing() {
        assert!(advertised_addrs("0.0.0.0:5000".parse().unwrap()).is_empty());
        assert_eq!(
            advertised_addrs("127.0.0.1:5000".parse().unwrap()),
            vec!["127.0.0.1:5000".to_string()]
        );
    }

    #[test]
    fn errors_render_context() {
        let bind = BindError {
            attempted: vec![],
            last_error: String::new(),
        };
        assert_eq!(bind.to_string(), "no listen addresses configured");

        let dial = DialError::Timeout {
            addr: "127.0.0.1:1".into(),
            after: Duration::from_secs(1),
        };
        assert!(dial.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let keypair = Keypair::generate();
        let config = TransportConfig {
            listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
            ..Default::default()
        };

        let overlay = Overlay::start(&keypair, config).await.unwrap();
        assert_ne!(overlay.local_addr().port(), 0);
        assert_eq!(overlay.identity(), keypair.identity());
        assert!(overlay.connected_peers().await.is_empty());
        assert!(overlay.events().await.is_some());
        assert!(overlay.events().await.is_none());

        overlay.stop().await;
        overlay.stop().await;
    }

    #[tokio::test]
    async fn start_without_listen_addrs_is_a_bind_error() {
        let config = TransportConfig {
            listen_addrs: vec![],
            ..Default::default()
        };
        let err = match Overlay::start(&Keypair::generate(), config).await {
            Ok(_) => panic!("expected bind failure"),
            Err(e) => e,
        };
        assert!(err.downcast_ref::<BindError>().is_some());
    }
}
