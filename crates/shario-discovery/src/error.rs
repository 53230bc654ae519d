//! Error types for discovery.

use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// DHT operation failed
    #[error("DHT operation failed: {0}")]
    Dht(String),

    /// RPC timed out
    #[error("DHT request timed out")]
    Timeout,

    /// No peers available to serve a DHT operation
    #[error("DHT routing table is empty")]
    NoPeers,

    /// Multicast socket setup or I/O failed
    #[error("Multicast error: {0}")]
    Multicast(String),

    /// Malformed message from the network
    #[error("Malformed discovery message: {0}")]
    Malformed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
