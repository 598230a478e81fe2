//! # Argus Relay - Peer-to-Peer Live Audio Streams
//!
//! Nodes announce the audio streams they publish, discover what others
//! publish, and relay the audio itself as chunked pub/sub messages. There is
//! no central server of record.
//!
//! - **Overlay**: QUIC with mutual TLS; Ed25519 public key = node identity
//! - **PubSub**: GossipSub-style topic broadcast with signed messages
//! - **Directory**: eventually-consistent registry kept alive by heartbeats
//! - **Publisher / Subscriber**: source bytes → `audio` / `iq_data` messages → buffers
//!
//! ## Architecture
//!
//! Every stateful component is a cheap `Clone` handle in front of a private
//! actor that owns its state and processes commands sequentially. Runtime
//! outcomes (peers, directory changes, stream events) are delivered on
//! bounded channels.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Composition root wiring all components |
//! | `identity` | Keypairs, Identities, Contacts |
//! | `crypto` | TLS certificate generation and verification, message signing |
//! | `transport` | Overlay: bind, dial, peer exchange, bootstrap re-scan |
//! | `rpc` | QUIC RPC client and server |
//! | `gossipsub` | Topic pub/sub engine |
//! | `directory` | Stream directory |
//! | `publisher` | Stream publisher |
//! | `subscriber` | Stream subscriber |
//! | `source` | Byte sources for published streams |
//! | `wire` | JSON stream and directory messages |
//! | `protocols` | Network traits the engines are generic over |
//! | `messages` | Node-to-node RPC envelopes |

mod crypto;
mod directory;
mod gossipsub;
mod identity;
mod messages;
mod node;
mod protocols;
mod publisher;
mod rpc;
mod source;
mod subscriber;
mod transport;
mod wire;

pub use crypto::SignatureError;
pub use directory::{
    DirectoryConfig, DirectoryEntry, DirectoryError, DirectoryEvent, RemovalReason,
    StreamCount, StreamDirectory,
};
pub use gossipsub::{
    GossipSub, GossipSubConfig, MessageRejection, ReceivedMessage, Subscription,
};
pub use identity::{Contact, Identity, Keypair};
pub use messages::{GossipSubRequest, MessageId};
pub use node::{Node, NodeConfig, NodeInfo, routable_addresses};
pub use protocols::GossipSubRpc;
pub use publisher::{
    ActiveStream, PublishError, PublishedStream, PublisherConfig, PublisherEvent,
    StreamPublisher,
};
pub use rpc::RpcNode;
pub use source::{ChunkSource, PayloadKind, StaticSource, StreamSource};
pub use subscriber::{
    Chunk, StreamBuffer, StreamSubscriber, SubscribeError, SubscriberConfig, SubscriberEvent,
    SubscriptionInfo, SubscriptionStatus,
};
pub use transport::{BindError, BootstrapPeer, DialError, Overlay, PeerEvent, TransportConfig};
pub use wire::{
    AnnouncedStream, DEFAULT_NAMESPACE, DecodeError, DirectoryMessage, StreamFilter,
    StreamMessage, StreamMetadata, directory_topic, stream_topic,
};
