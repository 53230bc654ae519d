//! Kademlia-style DHT for peer discovery.
//!
//! Nodes participate in a DHT keyed by 256-bit identifiers with the XOR
//! distance metric:
//!
//! - Node ids in DHT keyspace are the raw node identifier bytes
//! - K-bucket routing table (k=20) with stale-entry eviction
//! - Iterative lookup with alpha parallelism (α=3)
//! - Provider records: a node announces itself under the service key and
//!   queries the same key for other providers
//!
//! Messages are JSON over UDP. Provider announcements are public service
//! advertisements, so they ride unencrypted; sessions themselves are always
//! authenticated and encrypted one layer up.

pub mod dht_id;
pub mod messages;
pub mod routing;
pub mod service;

pub use dht_id::DhtId;
pub use messages::{DhtMessage, PeerContact, ProviderRecord};
pub use routing::{DhtPeer, RoutingTable};
pub use service::{DhtConfig, DhtService};

/// K: bucket size and lookup result width.
pub const K: usize = 20;

/// Alpha: parallelism factor for iterative lookups.
pub const ALPHA: usize = 3;

/// Number of buckets (one per possible distance prefix).
pub const NUM_BUCKETS: usize = 256;

/// Maximum iterations of the lookup loop.
pub const MAX_ITERATIONS: usize = 20;

/// How long a provider record stays valid without re-announcement.
pub const PROVIDER_TTL: std::time::Duration = std::time::Duration::from_secs(30);

/// Derive the DHT key a service tag is announced under.
#[must_use]
pub fn service_key(tag: &str) -> DhtId {
    DhtId::from_bytes(shario_crypto::hash::derive_key(
        "shario v1 dht service key",
        tag.as_bytes(),
    ))
}
