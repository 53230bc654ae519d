//! Error types for the transport host.

use shario_crypto::{CryptoError, NodeId};
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote address could not be reached
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// The remote authenticated as a different node than the one dialed
    #[error("Authentication failed: expected {expected}, remote is {actual}")]
    AuthFailed {
        /// Identifier we dialed
        expected: NodeId,
        /// Identifier the remote proved
        actual: NodeId,
    },

    /// Dial or handshake deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// No session exists with the peer
    #[error("Not connected to peer {}", .0.short())]
    NotConnected(NodeId),

    /// Handshake failed before the session was established
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A payload exceeded the per-message ceiling
    #[error("Message too large: {size} bytes (limit {limit})")]
    MessageTooLarge {
        /// Attempted payload size
        size: usize,
        /// Allowed ceiling
        limit: usize,
    },

    /// The connection closed while an operation was in flight
    #[error("Connection closed")]
    ConnectionClosed,

    /// Listener could not be bound
    #[error("Listen failed: {0}")]
    Listen(String),

    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cryptographic failure on an established session
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Malformed frame or record from the remote
    #[error("Protocol violation: {0}")]
    Protocol(Cow<'static, str>),
}

impl TransportError {
    /// Create a protocol violation error with static context
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        TransportError::Protocol(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        TransportError::Timeout(Cow::Borrowed(context))
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
