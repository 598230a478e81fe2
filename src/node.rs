//! # High-Level Node API
//!
//! A [`Node`] owns one instance of every component and wires them together:
//!
//! ```text
//!  StreamPublisher ──► StreamDirectory ──► GossipSub ◄── StreamSubscriber
//!                                              ▲
//!                              Overlay ────────┘ (peer add/remove, inbound RPC)
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:0").await?;
//! node.connect(&bootstrap_identity, "203.0.113.7:4433").await?;
//!
//! // Publish a recording
//! node.publisher()
//!     .publish_stream("fire-1", StreamSource::http(url), StreamMetadata::named("Fire"))
//!     .await?;
//!
//! // Or listen to someone else's
//! node.subscriber().subscribe_to_stream("fire-1").await?;
//! let mut rx = node.subscriber().listen("fire-1").await?;
//! while let Some(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! ```
//!
//! There is no global state; several nodes can live in one process.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::directory::{DirectoryConfig, StreamCount, StreamDirectory};
use crate::gossipsub::{GossipSub, GossipSubConfig};
use crate::identity::{Contact, Identity, Keypair};
use crate::publisher::{ActiveStream, PublisherConfig, StreamPublisher};
use crate::rpc::RpcNode;
use crate::subscriber::{StreamSubscriber, SubscriberConfig, SubscriptionStatus};
use crate::transport::{Overlay, TransportConfig};

#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub transport: TransportConfig,
    pub gossipsub: GossipSubConfig,
    pub directory: DirectoryConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
}

impl NodeConfig {
    /// Use `namespace` for every topic this node joins.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.directory.namespace = namespace.to_string();
        self.publisher.namespace = namespace.to_string();
        self.subscriber.namespace = namespace.to_string();
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.transport.listen_addrs = vec![addr];
        self
    }
}

/// Point-in-time summary of a node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub identity: String,
    pub addresses: Vec<String>,
    pub connected_peers: Vec<String>,
    pub streams: StreamCount,
    pub active_streams: Vec<ActiveStream>,
    pub subscriptions: Vec<SubscriptionStatus>,
}

pub struct Node {
    keypair: Keypair,
    overlay: Overlay,
    gossipsub: GossipSub<RpcNode>,
    directory: StreamDirectory<RpcNode>,
    publisher: StreamPublisher<RpcNode>,
    subscriber: StreamSubscriber<RpcNode>,
}

impl Node {
    /// Start a node with a fresh identity listening on `addr`.
    pub async fn bind(addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        Self::start(NodeConfig::default().with_listen_addr(addr)).await
    }

    pub async fn start(config: NodeConfig) -> Result<Self> {
        Self::start_with_keypair(config, Keypair::generate()).await
    }

    /// Start a node with a persistent identity.
    ///
    /// # Errors
    /// Fails only if no configured listen address can be bound.
    pub async fn start_with_keypair(config: NodeConfig, keypair: Keypair) -> Result<Self> {
        let overlay = Overlay::start(&keypair, config.transport).await?;

        let gossipsub = GossipSub::spawn(
            Arc::new(overlay.rpc().clone()),
            keypair.clone(),
            config.gossipsub,
        );
        overlay.serve(gossipsub.clone()).await?;

        let addresses = routable_addresses(overlay.local_addr());
        let directory = StreamDirectory::spawn(gossipsub.clone(), addresses, config.directory);
        directory
            .start()
            .await
            .context("failed to start stream directory")?;

        let publisher = StreamPublisher::spawn(gossipsub.clone(), directory.clone(), config.publisher);
        let subscriber = StreamSubscriber::spawn(gossipsub.clone(), config.subscriber);

        info!(
            identity = %keypair.identity(),
            addr = %overlay.local_addr(),
            "node started"
        );

        Ok(Self {
            keypair,
            overlay,
            gossipsub,
            directory,
            publisher,
            subscriber,
        })
    }

    /// Returns the node's identity as a hex-encoded string.
    pub fn identity(&self) -> String {
        self.keypair.identity().to_hex()
    }

    pub fn peer_identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.overlay.local_addr()
    }

    /// Addresses other nodes can reach us on; see [`routable_addresses`].
    pub fn routable_addresses(&self) -> Vec<String> {
        routable_addresses(self.overlay.local_addr())
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn pubsub(&self) -> &GossipSub<RpcNode> {
        &self.gossipsub
    }

    pub fn directory(&self) -> &StreamDirectory<RpcNode> {
        &self.directory
    }

    pub fn publisher(&self) -> &StreamPublisher<RpcNode> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &StreamSubscriber<RpcNode> {
        &self.subscriber
    }

    /// Dial a peer by identity and address and keep it in the re-dial set.
    ///
    /// # Errors
    /// - If the identity is not 64 hex characters
    /// - If the QUIC handshake fails or the peer presents another identity
    pub async fn connect(&self, identity: &str, addr: &str) -> Result<()> {
        let peer = Identity::from_hex(identity)
            .context("invalid identity: must be 64 hex characters")?;
        if peer == self.peer_identity() {
            anyhow::bail!("refusing to connect to self");
        }
        self.overlay
            .connect(Contact::single(peer, addr.to_string()))
            .await
    }

    pub async fn connected_peers(&self) -> Vec<Identity> {
        self.overlay.connected_peers().await
    }

    pub async fn info(&self) -> NodeInfo {
        NodeInfo {
            identity: self.identity(),
            addresses: self.routable_addresses(),
            connected_peers: self
                .connected_peers()
                .await
                .into_iter()
                .map(Identity::to_hex)
                .collect(),
            streams: self.directory.stream_count().await,
            active_streams: self.publisher.active_streams().await,
            subscriptions: self.subscriber.subscriptions().await,
        }
    }

    /// Stop streams and leave the network. Outstanding streams are ended
    /// and deregistered before connections close.
    pub async fn shutdown(&self) {
        self.publisher.stop().await;
        self.directory.stop().await;
        self.subscriber.stop().await;

        self.publisher.quit().await;
        self.directory.quit().await;
        self.subscriber.quit().await;
        self.gossipsub.quit().await;
        self.overlay.stop().await;
        debug!(identity = %self.peer_identity().short(), "node shut down");
    }
}

/// Addresses worth announcing for a socket bound to `local`.
///
/// A specific bind address is returned as is. For `0.0.0.0` / `::` the
/// outbound interface is discovered by connecting a UDP socket towards
/// public resolvers (no packet is sent), with loopback as a fallback.
pub fn routable_addresses(local: SocketAddr) -> Vec<String> {
    if !local.ip().is_unspecified() {
        return vec![local.to_string()];
    }
    let port = local.port();
    let (probe_bind, targets, loopback): (&str, &[&str], IpAddr) = if local.is_ipv4() {
        (
            "0.0.0.0:0",
            &["8.8.8.8:53", "1.1.1.1:53"],
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        )
    } else {
        (
            "[::]:0",
            &["[2001:4860:4860::8888]:53", "[2606:4700:4700::1111]:53"],
            IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        )
    };

    let mut addresses = Vec::new();
    for target in targets {
        if let Ok(socket) = std::net::UdpSocket::bind(probe_bind)
            && socket.connect(target).is_ok()
            && let Ok(probed) = socket.local_addr()
        {
            let ip = probed.ip();
            let addr = SocketAddr::new(ip, port).to_string();
            if !ip.is_loopback() && !ip.is_unspecified() && !addresses.contains(&addr) {
                addresses.push(addr);
            }
        }
    }
    addresses.push(SocketAddr::new(loopback, port).to_string());
    addresses
}
