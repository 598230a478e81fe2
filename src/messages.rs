//! # Overlay RPC Messages
//!
//! Node-to-node requests travelling over QUIC bidirectional streams,
//! serialized with bincode under a hard size limit.
//!
//! | Protocol | Request | Response |
//! |----------|---------|----------|
//! | Peer exchange | `RpcRequest::Hello` | `RpcResponse::Peers` |
//! | PubSub | `RpcRequest::GossipSub` | `RpcResponse::GossipSubAck` |
//!
//! Application payloads carried inside `GossipSubRequest::Publish` are
//! opaque bytes here; see [`crate::wire`] for the JSON stream protocol.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Contact, Identity};

/// Upper bound for any single RPC frame. Must fit one pub/sub message of
/// `gossipsub::MAX_MESSAGE_SIZE` plus envelope overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = 256 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub type MessageId = [u8; 32];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GossipSubRequest {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    /// Ask the receiver to add us to its mesh for `topic`.
    Graft {
        topic: String,
    },
    /// Ask the receiver to drop us from its mesh for `topic`; it should not
    /// re-graft before `backoff_secs` has elapsed.
    Prune {
        topic: String,
        backoff_secs: Option<u64>,
    },
    Publish {
        topic: String,
        msg_id: MessageId,
        source: Identity,
        seqno: u64,
        data: Vec<u8>,
        signature: Vec<u8>,
    },
    IHave {
        topic: String,
        msg_ids: Vec<MessageId>,
    },
    IWant {
        msg_ids: Vec<MessageId>,
    },
}

impl GossipSubRequest {
    pub fn topic(&self) -> Option<&str> {
        match self {
            GossipSubRequest::Subscribe { topic }
            | GossipSubRequest::Unsubscribe { topic }
            | GossipSubRequest::Graft { topic }
            | GossipSubRequest::Prune { topic, .. }
            | GossipSubRequest::Publish { topic, .. }
            | GossipSubRequest::IHave { topic, .. } => Some(topic),
            GossipSubRequest::IWant { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// First request on a freshly dialed connection. Carries the addresses
    /// the dialer listens on so the responder can dial it back later.
    Hello { listen_addrs: Vec<String> },
    GossipSub(GossipSubRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Contacts the responder is currently connected to.
    Peers(Vec<Contact>),
    GossipSubAck,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_identity(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    #[test]
    fn topic_accessor_covers_topic_scoped_variants() {
        assert_eq!(GossipSubRequest::Subscribe { topic: "a".into() }.topic(), Some("a"));
        assert_eq!(GossipSubRequest::Graft { topic: "b".into() }.topic(), Some("b"));
        assert_eq!(
            GossipSubRequest::Prune { topic: "c".into(), backoff_secs: Some(60) }.topic(),
            Some("c")
        );
        assert_eq!(
            GossipSubRequest::IHave { topic: "d".into(), msg_ids: vec![] }.topic(),
            Some("d")
        );
        assert_eq!(GossipSubRequest::IWant { msg_ids: vec![] }.topic(), None);
    }

    #[test]
    fn publish_request_survives_the_wire() {
        let request = RpcRequest::GossipSub(GossipSubRequest::Publish {
            topic: "argus-defense/stream/s1".to_string(),
            msg_id: [7u8; 32],
            source: make_identity(1),
            seqno: 42,
            data: vec![0xAB; 48 * 1024],
            signature: vec![0u8; 64],
        });

        let bytes = serialize_bounded(&request).unwrap();
        match deserialize_bounded::<RpcRequest>(&bytes).unwrap() {
            RpcRequest::GossipSub(GossipSubRequest::Publish { seqno, data, source, .. }) => {
                assert_eq!(seqno, 42);
                assert_eq!(data.len(), 48 * 1024);
                assert_eq!(source, make_identity(1));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let request = RpcRequest::GossipSub(GossipSubRequest::Publish {
            topic: "t".to_string(),
            msg_id: [0u8; 32],
            source: make_identity(1),
            seqno: 1,
            data: vec![0u8; MAX_DESERIALIZE_SIZE as usize + 1],
            signature: vec![],
        });
        let bytes = bincode::serialize(&request).unwrap();

        assert!(deserialize_bounded::<RpcRequest>(&bytes).is_err());
    }

    #[test]
    fn malformed_data_rejected() {
        assert!(deserialize_bounded::<RpcRequest>(&[0xFF, 0xFE, 0xFD, 0xFC, 0xFB]).is_err());

        let hello = RpcRequest::Hello { listen_addrs: vec!["127.0.0.1:9000".into()] };
        let bytes = serialize_bounded(&hello).unwrap();
        assert!(deserialize_bounded::<RpcRequest>(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn peers_response_carries_contacts() {
        let response = RpcResponse::Peers(vec![Contact::single(make_identity(3), "10.0.0.3:9000")]);
        let bytes = serialize_bounded(&response).unwrap();

        match deserialize_bounded::<RpcResponse>(&bytes).unwrap() {
            RpcResponse::Peers(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].identity, make_identity(3));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
