//! K-bucket routing table.

use super::dht_id::DhtId;
use super::{K, NUM_BUCKETS};
use shario_crypto::NodeId;
use std::net::SocketAddr;
use std::time::Instant;

/// A peer known to the DHT.
#[derive(Debug, Clone)]
pub struct DhtPeer {
    /// Position in the keyspace (the node id bytes)
    pub id: DhtId,
    /// Node identifier
    pub node_id: NodeId,
    /// UDP address of the peer's DHT endpoint
    pub addr: SocketAddr,
    /// When the peer was last heard from
    pub last_seen: Instant,
}

impl DhtPeer {
    /// Create a routing entry seen just now.
    #[must_use]
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id: DhtId::from_node_id(&node_id),
            node_id,
            addr,
            last_seen: Instant::now(),
        }
    }
}

/// One bucket of the routing table (up to [`K`] peers).
#[derive(Debug, Default, Clone)]
struct KBucket {
    peers: Vec<DhtPeer>,
}

impl KBucket {
    /// Insert or refresh a peer. A full bucket evicts its stalest entry.
    fn upsert(&mut self, peer: DhtPeer) {
        if let Some(existing) = self.peers.iter_mut().find(|p| p.id == peer.id) {
            existing.addr = peer.addr;
            existing.last_seen = peer.last_seen;
            return;
        }

        if self.peers.len() >= K {
            let stalest = self
                .peers
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_seen)
                .map(|(i, _)| i)
                .expect("non-empty bucket");
            self.peers.swap_remove(stalest);
        }
        self.peers.push(peer);
    }

    fn remove(&mut self, id: &DhtId) {
        self.peers.retain(|p| p.id != *id);
    }
}

/// Routing table: 256 buckets indexed by distance prefix from the local id.
#[derive(Debug)]
pub struct RoutingTable {
    local: DhtId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create an empty table centered on the local id.
    #[must_use]
    pub fn new(local: DhtId) -> Self {
        Self {
            local,
            buckets: vec![KBucket::default(); NUM_BUCKETS],
        }
    }

    /// Insert or refresh a peer. The local node itself is never stored.
    pub fn upsert(&mut self, peer: DhtPeer) {
        if let Some(index) = self.local.bucket_index(&peer.id) {
            self.buckets[index].upsert(peer);
        }
    }

    /// Drop a peer from the table.
    pub fn remove(&mut self, id: &DhtId) {
        if let Some(index) = self.local.bucket_index(id) {
            self.buckets[index].remove(id);
        }
    }

    /// Total number of peers across all buckets.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    /// Whether the table has any peers at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peer_count() == 0
    }

    /// Look up a peer by id.
    #[must_use]
    pub fn get(&self, id: &DhtId) -> Option<&DhtPeer> {
        let index = self.local.bucket_index(id)?;
        self.buckets[index].peers.iter().find(|p| p.id == *id)
    }

    /// The `count` peers closest to `target`, sorted by XOR distance.
    #[must_use]
    pub fn closest(&self, target: &DhtId, count: usize) -> Vec<DhtPeer> {
        let mut peers: Vec<DhtPeer> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter().cloned())
            .collect();
        peers.sort_by_key(|p| p.id.distance(target));
        peers.truncate(count);
        peers
    }
}
