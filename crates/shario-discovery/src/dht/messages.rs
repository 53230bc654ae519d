//! DHT wire messages.
//!
//! JSON-encoded request/response pairs over UDP. Every message carries the
//! sender's contact and a nonce; responses echo the request nonce, which is
//! how the service correlates them.

use super::dht_id::DhtId;
use serde::{Deserialize, Serialize};
use shario_crypto::NodeId;
use std::net::SocketAddr;

/// Contact information carried inside DHT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerContact {
    /// Node identifier
    pub node_id: NodeId,
    /// UDP address of the node's DHT endpoint
    pub addr: SocketAddr,
}

/// A provider record: who provides a service key and how to dial them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// The providing node
    pub node_id: NodeId,
    /// TCP addresses the provider's transport listens on
    pub addrs: Vec<SocketAddr>,
}

/// DHT RPC messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DhtMessage {
    /// Liveness probe
    Ping {
        /// Sender contact
        sender: PeerContact,
        /// Request nonce
        nonce: u64,
    },
    /// Liveness response
    Pong {
        /// Sender contact
        sender: PeerContact,
        /// Echoed request nonce
        nonce: u64,
    },
    /// Ask for the K closest peers to a target id
    FindNode {
        /// Sender contact
        sender: PeerContact,
        /// Request nonce
        nonce: u64,
        /// Lookup target
        target: DhtId,
    },
    /// Closest-peers response
    Nodes {
        /// Sender contact
        sender: PeerContact,
        /// Echoed request nonce
        nonce: u64,
        /// Closest peers known to the sender
        peers: Vec<PeerContact>,
    },
    /// Announce a provider record under a key
    Provide {
        /// Sender contact
        sender: PeerContact,
        /// Request nonce
        nonce: u64,
        /// Key being provided
        key: DhtId,
        /// The provider record to store
        record: ProviderRecord,
    },
    /// Acknowledge a stored provider record
    ProvideAck {
        /// Sender contact
        sender: PeerContact,
        /// Echoed request nonce
        nonce: u64,
    },
    /// Ask for the providers of a key
    GetProviders {
        /// Sender contact
        sender: PeerContact,
        /// Request nonce
        nonce: u64,
        /// Key being queried
        key: DhtId,
    },
    /// Providers response
    Providers {
        /// Sender contact
        sender: PeerContact,
        /// Echoed request nonce
        nonce: u64,
        /// Valid provider records for the key
        providers: Vec<ProviderRecord>,
        /// Peers closer to the key, for iterative widening
        closer: Vec<PeerContact>,
    },
}

impl DhtMessage {
    /// The sender contact of any message.
    #[must_use]
    pub fn sender(&self) -> &PeerContact {
        match self {
            DhtMessage::Ping { sender, .. }
            | DhtMessage::Pong { sender, .. }
            | DhtMessage::FindNode { sender, .. }
            | DhtMessage::Nodes { sender, .. }
            | DhtMessage::Provide { sender, .. }
            | DhtMessage::ProvideAck { sender, .. }
            | DhtMessage::GetProviders { sender, .. }
            | DhtMessage::Providers { sender, .. } => sender,
        }
    }

    /// The nonce of any message.
    #[must_use]
    pub fn nonce(&self) -> u64 {
        match self {
            DhtMessage::Ping { nonce, .. }
            | DhtMessage::Pong { nonce, .. }
            | DhtMessage::FindNode { nonce, .. }
            | DhtMessage::Nodes { nonce, .. }
            | DhtMessage::Provide { nonce, .. }
            | DhtMessage::ProvideAck { nonce, .. }
            | DhtMessage::GetProviders { nonce, .. }
            | DhtMessage::Providers { nonce, .. } => *nonce,
        }
    }

    /// Whether this message is a response (completes a pending request).
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            DhtMessage::Pong { .. }
                | DhtMessage::Nodes { .. }
                | DhtMessage::ProvideAck { .. }
                | DhtMessage::Providers { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(fill: u8, port: u16) -> PeerContact {
        PeerContact {
            node_id: NodeId::from_bytes([fill; 32]),
            addr: format!("127.0.0.1:{port}").parse().unwrap(),
        }
    }

    #[test]
    fn test_message_serde_round_trip() {
        let msg = DhtMessage::Provide {
            sender: contact(1, 9000),
            nonce: 42,
            key: DhtId::from_bytes([9u8; 32]),
            record: ProviderRecord {
                node_id: NodeId::from_bytes([1u8; 32]),
                addrs: vec!["10.0.0.1:4040".parse().unwrap()],
            },
        };

        let json = serde_json::to_vec(&msg).unwrap();
        let back: DhtMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.nonce(), 42);
        assert!(matches!(back, DhtMessage::Provide { .. }));
    }

    #[test]
    fn test_type_tag_on_the_wire() {
        let msg = DhtMessage::Ping {
            sender: contact(2, 9001),
            nonce: 7,
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["nonce"], 7);
    }

    #[test]
    fn test_response_classification() {
        let sender = contact(3, 9002);
        assert!(!DhtMessage::Ping { sender, nonce: 1 }.is_response());
        assert!(DhtMessage::Pong { sender, nonce: 1 }.is_response());
        assert!(DhtMessage::Nodes {
            sender,
            nonce: 1,
            peers: vec![]
        }
        .is_response());
    }
}
