//! # Shario Crypto
//!
//! Cryptographic primitives for the Shario node.
//!
//! This crate provides:
//! - `Noise_XX` handshake for mutual authentication of sessions
//! - RSA-2048 identity signatures and the node identifier type
//! - Deterministic derivation of the Noise static key from the identity key
//! - SHA-256 content digests for transfer integrity
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | Session AEAD | ChaCha20-Poly1305 (via Noise) | 256-bit key |
//! | Identity Signatures | RSA-2048 PKCS#1 v1.5 / SHA-256 | 112-bit |
//! | KDF | BLAKE3 derive_key | 128-bit |
//! | Content Digest | SHA-256 | 128-bit collision |

#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod node_id;
pub mod noise;
pub mod signatures;

pub use error::CryptoError;
pub use node_id::NodeId;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// RSA identity key size in bits
pub const RSA_KEY_BITS: usize = 2048;

/// RSA signature size in bytes (key size / 8)
pub const RSA_SIGNATURE_SIZE: usize = RSA_KEY_BITS / 8;

/// Largest ciphertext a single Noise transport record may carry.
pub const NOISE_MAX_MESSAGE_SIZE: usize = 65535;
