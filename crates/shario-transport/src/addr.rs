//! Dialable peer addresses.
//!
//! A dialable address couples a socket address with the node identifier the
//! dialer expects to find there, printed as `"<ip>:<port>/<node_id_hex>"`.
//! The identifier suffix is what turns a plain address into an authenticated
//! dial target: the handshake fails unless the remote proves that identity.

use serde::{Deserialize, Serialize};
use shario_crypto::NodeId;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A socket address plus the expected node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    /// Socket address to connect to
    pub addr: SocketAddr,
    /// Node identifier expected at that address
    pub node_id: NodeId,
}

impl PeerAddr {
    /// Create a new dialable address.
    #[must_use]
    pub const fn new(addr: SocketAddr, node_id: NodeId) -> Self {
        Self { addr, node_id }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.node_id)
    }
}

impl FromStr for PeerAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, id) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("missing '/<node_id>' suffix in '{s}'"))?;

        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| format!("invalid socket address '{addr}': {e}"))?;
        let node_id: NodeId = id.parse().map_err(|e| format!("invalid node id: {e}"))?;

        Ok(Self { addr, node_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_round_trip_v4() {
        let peer = PeerAddr::new(
            "192.168.1.7:4040".parse().unwrap(),
            NodeId::from_bytes([3u8; 32]),
        );

        let s = peer.to_string();
        let parsed: PeerAddr = s.parse().unwrap();
        assert_eq!(parsed, peer);
    }

    #[test]
    fn test_display_parse_round_trip_v6() {
        let peer = PeerAddr::new(
            "[::1]:9999".parse().unwrap(),
            NodeId::from_bytes([0xfe; 32]),
        );

        let parsed: PeerAddr = peer.to_string().parse().unwrap();
        assert_eq!(parsed, peer);
    }

    #[test]
    fn test_parse_rejects_missing_suffix() {
        assert!("127.0.0.1:4040".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_parse_rejects_bad_id() {
        assert!("127.0.0.1:4040/zzzz".parse::<PeerAddr>().is_err());
    }
}
