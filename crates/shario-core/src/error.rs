//! Error types for the node core.
//!
//! Only start-up errors (configuration, identity file) are fatal; everything
//! else is handled locally per the recovery policy of its component.

use crate::transfer::TransferId;
use shario_crypto::NodeId;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in node operations
#[derive(Debug, Error)]
pub enum NodeError {
    // ============ Start-up (fatal) ============
    /// Invalid configuration (unwritable config dir, bad paths)
    #[error("Invalid configuration: {0}")]
    Config(Cow<'static, str>),

    /// Identity file could not be loaded, parsed or verified
    #[error("Identity error: {0}")]
    Identity(String),

    // ============ Layered errors ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] shario_transport::TransportError),

    /// Discovery operation failed
    #[error("Discovery error: {0}")]
    Discovery(#[from] shario_discovery::DiscoveryError),

    // ============ Application state ============
    /// Transfer operation failed
    #[error("Transfer error: {0}")]
    Transfer(Cow<'static, str>),

    /// Transfer not found
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    /// Peer not found in the registry
    #[error("Peer not found: {}", .0.short())]
    PeerNotFound(NodeId),

    /// Room not found
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Nickname was empty after trimming
    #[error("Nickname must not be empty")]
    EmptyNickname,

    /// Invalid state transition or precondition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Encoding and I/O ============
    /// Serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File or filesystem I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Create a configuration error with static context
    #[must_use]
    pub const fn config(context: &'static str) -> Self {
        NodeError::Config(Cow::Borrowed(context))
    }

    /// Create a transfer error with static context
    #[must_use]
    pub const fn transfer(context: &'static str) -> Self {
        NodeError::Transfer(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Whether this error is fatal at start-up rather than recoverable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Config(_) | NodeError::Identity(_))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(NodeError::config("bad dir").is_fatal());
        assert!(NodeError::Identity("tampered".to_string()).is_fatal());
        assert!(!NodeError::transfer("chunk failed").is_fatal());
        assert!(!NodeError::EmptyNickname.is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = NodeError::RoomNotFound("global".to_string());
        assert!(err.to_string().contains("global"));

        let err = NodeError::PeerNotFound(NodeId::from_bytes([0xab; 32]));
        assert!(err.to_string().contains("abababab"));
    }
}
