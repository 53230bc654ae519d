//! # Shario Discovery
//!
//! Peer discovery for Shario nodes. Two mechanisms run concurrently under a
//! single shutdown signal:
//!
//! - **Link-local multicast**: a periodic JSON beacon under the fixed
//!   service tag, answered by dialing the beacon's source.
//! - **DHT**: a Kademlia-style distributed hash table over UDP. Nodes
//!   announce themselves as providers of the service key and query it for
//!   other providers.
//!
//! Both loops survive transient failures; discovered peers are forwarded as
//! dialable [`shario_transport::PeerAddr`]s on a channel the node owns. A
//! periodic health check raises a warning when discovery stays silent.

#![warn(clippy::all)]

pub mod dht;
pub mod error;
pub mod manager;
pub mod multicast;

pub use error::DiscoveryError;
pub use manager::{DiscoveryConfig, DiscoveryManager};

/// Service tag advertised by every discovery mechanism.
pub const SERVICE_TAG: &str = "shario-p2p";
