//! # Shario Core
//!
//! Node core for Shario, a decentralized peer-to-peer file-sharing and
//! messaging application. This crate wires the transport and discovery
//! layers into the application protocols:
//!
//! - **Identity store**: a persisted keypair whose public half is the node's
//!   name on the network, plus the mutable nickname
//! - **Session registry**: one logical peer per identifier regardless of how
//!   many underlying connections exist, with exactly-once connect and
//!   disconnect events
//! - **Chat**: the global room every node joins, lazily created direct
//!   rooms, nickname propagation
//! - **Transfer**: offer/accept/data/complete/cancel file transfers with
//!   1 KiB chunks, progress reporting and SHA-256 integrity verification
//! - **Node**: the root coordinator owning all of the above and the
//!   shutdown signal
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Node                                │
//! │   (coordinator, shutdown watch, dial loop)               │
//! ├──────────────┬───────────────┬───────────────────────────┤
//! │   Chat       │   Transfers   │   Session Registry        │
//! ├──────────────┴───────────────┴───────────────────────────┤
//! │   Transport Host      │      Discovery (mDNS-style+DHT)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Cross-component references go by node identifier or transfer identifier;
//! the registry owns the peer table, chat owns the rooms, the transfer
//! manager owns the transfers and their file handles.

#![warn(clippy::all)]

pub mod chat;
pub mod config;
pub mod error;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod transfer;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::Node;

/// Substream protocol name for chat messages.
pub const PROTOCOL_CHAT: &str = "/shario/chat/1.0.0";

/// Substream protocol name for transfer messages.
pub const PROTOCOL_TRANSFER: &str = "/shario/transfer/1.0.0";

/// Fixed transfer chunk payload size in bytes.
///
/// Chosen so that a chunk survives base64 expansion (4/3) plus JSON framing
/// well under the transport's per-message ceiling. This is part of the wire
/// protocol, not configuration: the receiver derives the expected chunk
/// index from bytes received so far, which only works when both ends chunk
/// with the same constant.
pub const CHUNK_SIZE: usize = 1024;
