//! Network seams between the protocol engines and the RPC layer.
//!
//! The engines are generic over these traits so they can be driven by the
//! QUIC [`RpcNode`](crate::rpc::RpcNode) in production and by in-memory
//! fakes in unit tests.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Contact;
use crate::messages::GossipSubRequest;

#[async_trait]
pub trait GossipSubRpc: Send + Sync + 'static {
    async fn send_gossipsub(&self, to: &Contact, message: GossipSubRequest) -> Result<()>;
}

#[async_trait]
pub trait PeerExchangeRpc: Send + Sync + 'static {
    /// Introduce ourselves to `to` and learn who it is connected to.
    async fn hello(&self, to: &Contact, listen_addrs: Vec<String>) -> Result<Vec<Contact>>;
}
