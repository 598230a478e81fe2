//! # RPC Layer
//!
//! QUIC request/response plumbing shared by every overlay protocol.
//!
//! - [`RpcNode`]: cheap-to-clone handle used to send requests
//! - `RpcNodeActor`: owns the per-peer connection cache
//! - [`handle_connection`]: server side, one task per inbound connection and
//!   one per bidirectional stream
//!
//! Frames are a 4-byte big-endian length followed by a bincode body. Every
//! request is authenticated by the TLS-verified peer identity of the
//! connection it arrives on; nothing in the body is trusted for identity.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::crypto::{extract_verified_identity, identity_to_sni};
use crate::gossipsub::GossipSub;
use crate::identity::{Contact, Identity};
use crate::messages::{self, GossipSubRequest, RpcRequest, RpcResponse};
use crate::protocols::{GossipSubRpc, PeerExchangeRpc};
use crate::transport::{DialError, Overlay};

const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

const MAX_CACHED_CONNECTIONS: usize = 1_000;

/// Idle connections older than this must pass a passive health check
/// before being reused.
const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(60);

const RPC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound on establishing a new QUIC connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Peers returned in a single `Hello` reply.
const MAX_CONTACTS_PER_RESPONSE: usize = 32;

enum RpcCommand {
    Get {
        peer_id: Identity,
        reply: oneshot::Sender<Option<Connection>>,
    },
    Insert {
        peer_id: Identity,
        connection: Connection,
    },
    Invalidate {
        peer_id: Identity,
    },
    MarkSuccess {
        peer_id: Identity,
    },
    Quit,
}

struct RpcNodeActor {
    connections: LruCache<Identity, CachedConnection>,
}

impl RpcNodeActor {
    fn new() -> Self {
        let capacity = NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        Self {
            connections: LruCache::new(capacity),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        let mut cleanup_interval = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RpcCommand::Get { peer_id, reply }) => {
                            let _ = reply.send(self.get(&peer_id));
                        }
                        Some(RpcCommand::Insert { peer_id, connection }) => {
                            self.insert(peer_id, connection);
                        }
                        Some(RpcCommand::Invalidate { peer_id }) => {
                            if self.connections.pop(&peer_id).is_some() {
                                debug!(peer = %peer_id.short(), "invalidated cached connection");
                            }
                        }
                        Some(RpcCommand::MarkSuccess { peer_id }) => {
                            if let Some(cached) = self.connections.get_mut(&peer_id) {
                                cached.mark_success();
                            }
                        }
                        Some(RpcCommand::Quit) | None => {
                            debug!("RpcNode actor shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_closed_connections();
                }
            }
        }
    }

    fn get(&mut self, peer_id: &Identity) -> Option<Connection> {
        let cached = self.connections.get_mut(peer_id)?;
        if cached.is_closed() {
            self.connections.pop(peer_id);
            return None;
        }
        if cached.is_stale() {
            if !cached.check_health_passive() {
                debug!(peer = %peer_id.short(), "stale connection failed passive health check");
                self.connections.pop(peer_id);
                return None;
            }
            cached.mark_success();
        }
        Some(cached.connection.clone())
    }

    /// A live cached connection wins over a newer duplicate so both ends keep
    /// using whichever connection was established first.
    fn insert(&mut self, peer_id: Identity, connection: Connection) {
        if let Some(existing) = self.connections.get(&peer_id)
            && !existing.is_closed()
        {
            trace!(peer = %peer_id.short(), "keeping existing connection");
            return;
        }
        self.connections.put(peer_id, CachedConnection::new(connection));
    }

    fn cleanup_closed_connections(&mut self) {
        let closed: Vec<Identity> = self
            .connections
            .iter()
            .filter(|(_, cached)| cached.is_closed())
            .map(|(id, _)| *id)
            .collect();

        for peer_id in closed {
            self.connections.pop(&peer_id);
            trace!(peer = %peer_id.short(), "cleaned up closed connection");
        }
    }
}

struct CachedConnection {
    connection: Connection,
    last_success: Instant,
}

impl CachedConnection {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            last_success: Instant::now(),
        }
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn is_stale(&self) -> bool {
        self.last_success.elapsed() > CONNECTION_STALE_TIMEOUT
    }

    fn mark_success(&mut self) {
        self.last_success = Instant::now();
    }

    fn check_health_passive(&self) -> bool {
        !self.is_closed() && !self.connection.rtt().is_zero()
    }
}

#[derive(Clone)]
pub struct RpcNode {
    endpoint: Endpoint,
    client_config: ClientConfig,
    dial_timeout: Duration,
    cmd_tx: mpsc::Sender<RpcCommand>,
}

impl RpcNode {
    pub fn new(endpoint: Endpoint, client_config: ClientConfig, dial_timeout: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        tokio::spawn(RpcNodeActor::new().run(cmd_rx));

        Self {
            endpoint,
            client_config,
            dial_timeout,
            cmd_tx,
        }
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Quit).await;
    }

    async fn cached(&self, peer_id: &Identity) -> Result<Option<Connection>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::Get {
                peer_id: *peer_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("RPC actor closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("RPC actor closed"))
    }

    /// Cache an already-established connection (inbound or freshly dialed).
    pub async fn register(&self, peer_id: Identity, connection: Connection) {
        let _ = self
            .cmd_tx
            .send(RpcCommand::Insert {
                peer_id,
                connection,
            })
            .await;
    }

    pub async fn invalidate(&self, peer_id: &Identity) {
        let _ = self
            .cmd_tx
            .send(RpcCommand::Invalidate { peer_id: *peer_id })
            .await;
    }

    async fn mark_connection_success(&self, peer_id: &Identity) {
        let _ = self
            .cmd_tx
            .send(RpcCommand::MarkSuccess { peer_id: *peer_id })
            .await;
    }

    /// Return the cached connection to `contact` or dial one. The dial runs
    /// on the caller's task so a slow handshake never stalls other peers.
    pub async fn connect(&self, contact: &Contact) -> Result<Connection> {
        if let Some(conn) = self.cached(&contact.identity).await? {
            return Ok(conn);
        }

        let mut last_error = None;
        for addr_str in &contact.addrs {
            let addr: SocketAddr = match addr_str.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    last_error = Some(anyhow::Error::from(DialError::Failed {
                        addr: addr_str.clone(),
                        reason: format!("invalid address: {}", e),
                    }));
                    continue;
                }
            };
            match self.dial(addr, &contact.identity).await {
                Ok(conn) => {
                    self.register(contact.identity, conn.clone()).await;
                    return Ok(conn);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("contact has no addresses")))
    }

    async fn dial(&self, addr: SocketAddr, expected_peer_id: &Identity) -> Result<Connection> {
        let sni = identity_to_sni(expected_peer_id);
        debug!(addr = %addr, peer = %expected_peer_id.short(), "dialing peer");

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &sni)
            .map_err(|e| DialError::Failed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.dial_timeout, connecting).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(DialError::Failed {
                addr: addr.to_string(),
                reason: e.to_string(),
            }
            .into()),
            Err(_) => Err(DialError::Timeout {
                addr: addr.to_string(),
                after: self.dial_timeout,
            }
            .into()),
        }
    }

    async fn rpc_raw(&self, contact: &Contact, request: RpcRequest) -> Result<RpcResponse> {
        let peer_id = contact.identity;
        let conn = self.connect(contact).await?;

        let result = self.rpc_inner(&conn, contact, request).await;
        match &result {
            Ok(_) => self.mark_connection_success(&peer_id).await,
            Err(_) if conn.close_reason().is_some() => self.invalidate(&peer_id).await,
            Err(_) => {}
        }
        result
    }

    async fn rpc_inner(
        &self,
        conn: &Connection,
        contact: &Contact,
        request: RpcRequest,
    ) -> Result<RpcResponse> {
        tokio::time::timeout(RPC_STREAM_TIMEOUT, async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .context("failed to open bidirectional stream")?;

            let request_bytes =
                messages::serialize_bounded(&request).context("failed to serialize request")?;
            send.write_all(&(request_bytes.len() as u32).to_be_bytes()).await?;
            send.write_all(&request_bytes).await?;
            send.finish()?;

            let mut len_buf = [0u8; 4];
            recv.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;

            if len > MAX_RESPONSE_SIZE {
                warn!(
                    peer = %contact.identity.short(),
                    size = len,
                    max = MAX_RESPONSE_SIZE,
                    "peer sent oversized response"
                );
                anyhow::bail!("response too large: {} bytes (max {})", len, MAX_RESPONSE_SIZE);
            }

            let mut response_bytes = vec![0u8; len];
            recv.read_exact(&mut response_bytes).await?;

            messages::deserialize_bounded::<RpcResponse>(&response_bytes)
                .context("failed to deserialize response")
        })
        .await
        .context("RPC timed out")?
    }
}

#[async_trait]
impl GossipSubRpc for RpcNode {
    async fn send_gossipsub(&self, to: &Contact, message: GossipSubRequest) -> Result<()> {
        match self.rpc_raw(to, RpcRequest::GossipSub(message)).await? {
            RpcResponse::GossipSubAck => Ok(()),
            RpcResponse::Error { message } => anyhow::bail!("GossipSub rejected: {}", message),
            other => anyhow::bail!("unexpected response to GossipSub: {:?}", other),
        }
    }
}

#[async_trait]
impl PeerExchangeRpc for RpcNode {
    async fn hello(&self, to: &Contact, listen_addrs: Vec<String>) -> Result<Vec<Contact>> {
        match self.rpc_raw(to, RpcRequest::Hello { listen_addrs }).await? {
            RpcResponse::Peers(mut peers) => {
                if peers.len() > MAX_CONTACTS_PER_RESPONSE {
                    warn!(
                        peer = %to.identity.short(),
                        count = peers.len(),
                        "peer returned too many contacts, truncating"
                    );
                    peers.truncate(MAX_CONTACTS_PER_RESPONSE);
                }
                peers.retain(|c| c.validate_structure() && c.identity.is_valid());
                Ok(peers)
            }
            RpcResponse::Error { message } => anyhow::bail!("Hello rejected: {}", message),
            other => anyhow::bail!("unexpected response to Hello: {:?}", other),
        }
    }
}

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REQUEST_SIZE: usize = messages::MAX_DESERIALIZE_SIZE as usize;

/// Serve one inbound connection until the peer goes away.
pub async fn handle_connection(
    overlay: Overlay,
    gossipsub: GossipSub<RpcNode>,
    incoming: Incoming,
) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();

    let Some(verified_identity) = extract_verified_identity(&connection) else {
        warn!(remote = %remote, "rejecting connection: could not verify peer identity");
        return Err(anyhow::anyhow!("could not verify peer identity from certificate"));
    };

    let from_contact = Contact::single(verified_identity, remote.to_string());
    overlay
        .peer_connected(from_contact.clone(), connection.clone())
        .await;

    info!("Peer {}/{}", remote, verified_identity);

    loop {
        let stream = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(remote = %remote, "connection closed");
                break Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };

        let overlay = overlay.clone();
        let gossipsub = gossipsub.clone();
        let from_contact = from_contact.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(overlay, gossipsub, stream, from_contact).await {
                debug!(error = ?e, "stream error");
            }
        });
    }
}

async fn write_response(send: &mut quinn::SendStream, response: &RpcResponse) -> Result<()> {
    let response_bytes = bincode::serialize(response).context("failed to serialize response")?;
    send.write_all(&(response_bytes.len() as u32).to_be_bytes()).await?;
    send.write_all(&response_bytes).await?;
    send.finish()?;
    Ok(())
}

async fn handle_stream(
    overlay: Overlay,
    gossipsub: GossipSub<RpcNode>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    from_contact: Contact,
) -> Result<()> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow::anyhow!("request header read timed out"))??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_REQUEST_SIZE {
        warn!(
            peer = %from_contact.identity.short(),
            size = len,
            max = MAX_REQUEST_SIZE,
            "rejecting oversized request"
        );
        let error = RpcResponse::Error {
            message: format!("request too large: {} bytes (max {})", len, MAX_REQUEST_SIZE),
        };
        return write_response(&mut send, &error).await;
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

    let request: RpcRequest =
        messages::deserialize_bounded(&request_bytes).context("failed to deserialize request")?;

    let response = match tokio::time::timeout(
        REQUEST_PROCESS_TIMEOUT,
        handle_rpc_request(&overlay, &gossipsub, &from_contact, request),
    )
    .await
    {
        Ok(resp) => resp,
        Err(_) => {
            warn!(peer = %from_contact.identity.short(), "request processing timed out");
            RpcResponse::Error {
                message: "request processing timeout".to_string(),
            }
        }
    };

    write_response(&mut send, &response).await
}

async fn handle_rpc_request(
    overlay: &Overlay,
    gossipsub: &GossipSub<RpcNode>,
    from: &Contact,
    request: RpcRequest,
) -> RpcResponse {
    match request {
        RpcRequest::Hello { listen_addrs } => {
            trace!(from = %from.identity.short(), addrs = ?listen_addrs, "handling HELLO");
            match overlay.handle_hello(from.clone(), listen_addrs).await {
                Ok(peers) => RpcResponse::Peers(peers),
                Err(e) => RpcResponse::Error {
                    message: format!("hello failed: {}", e),
                },
            }
        }
        RpcRequest::GossipSub(message) => {
            trace!(from = %from.identity.short(), message = ?message.topic(), "dispatching GOSSIPSUB request");
            match gossipsub.handle_message(from, message).await {
                Ok(()) => RpcResponse::GossipSubAck,
                Err(e) => {
                    warn!(from = %from.identity.short(), error = %e, "GossipSub handler returned error");
                    RpcResponse::Error {
                        message: format!("GossipSub error: {}", e),
                    }
                }
            }
        }
    }
}
