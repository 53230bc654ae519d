//! Rooms and messages.
//!
//! The chat component owns this state: the global room every node joins at
//! start-up, direct rooms created lazily per remote, and local-test rooms
//! that never touch the network.

use serde::{Deserialize, Serialize};
use shario_crypto::NodeId;
use std::collections::HashMap;

/// Identifier of the global room.
pub const GLOBAL_ROOM_ID: &str = "global";

/// Display name of the global room.
pub const GLOBAL_ROOM_NAME: &str = "Global Chat";

/// Room kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomType {
    /// The open room every connected node participates in
    Global,
    /// A two-party room keyed by the sorted identifier pair
    Direct,
    /// A local room for testing; never causes network traffic
    LocalTest,
}

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// User text
    Text,
    /// Locally produced status line
    System,
    /// Room join notification
    Join,
    /// Room leave notification
    Leave,
    /// Nickname change notification
    NicknameChange,
    /// Typing indicator (never stored)
    Typing,
}

/// A chat message as stored in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within the session
    pub id: String,
    /// UTF-8 content
    pub content: String,
    /// Sender nickname snapshot at send time
    pub sender: String,
    /// Sender node identifier
    pub sender_id: NodeId,
    /// Unix seconds
    pub timestamp: u64,
    /// Room this message belongs to
    pub room_id: String,
    /// Message kind
    pub kind: MessageKind,
}

/// A chat room.
#[derive(Debug, Clone)]
pub struct Room {
    /// Room identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Room kind
    pub kind: RoomType,
    /// Participants: identifier to nickname
    pub participants: HashMap<NodeId, String>,
    /// Ordered message history for this session
    pub messages: Vec<Message>,
    /// Messages appended since the room was last marked read
    pub unread: u64,
    /// Unix seconds of creation
    pub created_at: u64,
    /// Cached last message
    pub last_message: Option<Message>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: String, name: String, kind: RoomType, created_at: u64) -> Self {
        Self {
            id,
            name,
            kind,
            participants: HashMap::new(),
            messages: Vec::new(),
            unread: 0,
            created_at,
            last_message: None,
        }
    }

    /// Add or update a participant. Returns true if anything changed.
    pub fn upsert_participant(&mut self, id: NodeId, nickname: String) -> bool {
        match self.participants.get(&id) {
            Some(existing) if *existing == nickname => false,
            _ => {
                self.participants.insert(id, nickname);
                true
            }
        }
    }

    /// Remove a participant. Returns true if they were present.
    pub fn remove_participant(&mut self, id: &NodeId) -> bool {
        self.participants.remove(id).is_some()
    }

    /// Whether the given node participates in this room.
    #[must_use]
    pub fn has_participant(&self, id: &NodeId) -> bool {
        self.participants.contains_key(id)
    }

    /// Append a message, updating the last-message cache and unread counter.
    pub fn push_message(&mut self, message: Message) {
        debug_assert_eq!(message.room_id, self.id);
        self.last_message = Some(message.clone());
        self.messages.push(message);
        self.unread += 1;
    }

    /// Reset the unread counter.
    pub fn mark_read(&mut self) {
        self.unread = 0;
    }
}

/// Deterministic identifier of the direct room between two nodes.
///
/// Independent of argument order: the sorted hex pair joined by `:`.
#[must_use]
pub fn direct_room_id(a: &NodeId, b: &NodeId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}
