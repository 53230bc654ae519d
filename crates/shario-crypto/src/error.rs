//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Debug, Error, Clone)]
pub enum CryptoError {
    /// Noise handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Decryption failed (bad MAC or corrupted record)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Signature did not verify
    #[error("Invalid signature")]
    InvalidSignature,

    /// Key material had the wrong length or encoding
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Node identifier could not be parsed
    #[error("Invalid node identifier: {0}")]
    InvalidNodeId(String),
}

impl From<snow::Error> for CryptoError {
    fn from(e: snow::Error) -> Self {
        CryptoError::Handshake(e.to_string())
    }
}

impl From<rsa::Error> for CryptoError {
    fn from(e: rsa::Error) -> Self {
        CryptoError::InvalidKey(e.to_string())
    }
}
