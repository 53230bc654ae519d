//! # Shario Transport
//!
//! TCP transport host for Shario nodes.
//!
//! This crate owns the set of authenticated encrypted sessions:
//! - Dual-stack listeners (IPv4 and IPv6, ephemeral ports by default)
//! - Dialing with a hard timeout and identifier verification
//! - `Noise_XX` handshakes binding every session to the remote node id
//! - Length-prefixed encrypted records carrying one-message substreams
//!
//! A substream is short-lived by design: each application message is a fresh
//! logical stream named by its protocol string and carrying a single framed
//! payload. Ordering holds within a connection, so a sender that awaits each
//! substream before opening the next gets in-order delivery.
//!
//! Connection lifecycle and inbound messages are surfaced as
//! [`TransportEvent`]s on a channel handed in at construction; deduplicating
//! events per logical peer is the session registry's job, one layer up.

#![warn(clippy::all)]

pub mod addr;
pub mod error;
pub mod framing;
pub mod host;
pub mod session;

pub use addr::PeerAddr;
pub use error::TransportError;
pub use framing::Frame;
pub use host::{Substream, TransportConfig, TransportEvent, TransportHost};

/// Ceiling for a single substream payload.
///
/// Application protocols must stay below this; the 1 KiB transfer chunk plus
/// base64 and JSON framing sits comfortably under it.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
