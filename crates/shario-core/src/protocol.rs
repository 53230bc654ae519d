//! Wire protocol payloads.
//!
//! Every substream carries a single UTF-8 JSON object of the shape
//! `{ "type": <string>, "data": <object> }`; the adjacently tagged enums
//! below produce exactly that envelope. Unknown `type` values fail to parse
//! and the message is dropped by the receiving component.

use crate::room::{MessageKind, RoomType};
use crate::transfer::TransferId;
use serde::{Deserialize, Serialize};
use shario_crypto::NodeId;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Fresh message identifier, unique within a session.
#[must_use]
pub fn message_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Chat protocol payloads (`/shario/chat/1.0.0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatPayload {
    /// User text in a room
    Text {
        /// Message identifier
        id: String,
        /// UTF-8 content
        content: String,
        /// Sender nickname snapshot
        sender: String,
        /// Sender node identifier
        sender_id: NodeId,
        /// Unix seconds
        timestamp: u64,
        /// Target room
        room_id: String,
        /// Message kind stamp
        #[serde(rename = "type")]
        kind: MessageKind,
    },
    /// Room state offered to a newly connected peer
    Join {
        /// Room identifier
        room_id: String,
        /// Display name
        room_name: String,
        /// Room kind
        room_type: RoomType,
        /// Unix seconds of room creation
        created_at: u64,
        /// Participants: identifier to nickname
        participants: HashMap<NodeId, String>,
    },
    /// Voluntary leave notification
    Leave {
        /// Room being left
        room_id: String,
    },
    /// Typing indicator; never stored as a message
    Typing {
        /// Room the indicator applies to
        room_id: String,
        /// Whether the sender is currently typing
        is_typing: bool,
    },
    /// Nickname change notification, sent to every connected peer
    NicknameChange {
        /// Previous nickname
        old_nickname: String,
        /// New nickname
        new_nickname: String,
        /// Renaming node
        peer_id: NodeId,
    },
    /// Locally produced status line (rarely sent)
    System {
        /// Message identifier
        id: String,
        /// Status text
        content: String,
        /// Unix seconds
        timestamp: u64,
        /// Room the line belongs to
        room_id: String,
    },
}

/// Transfer protocol payloads (`/shario/transfer/1.0.0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TransferPayload {
    /// Offer a file
    Offer {
        /// Transfer identifier
        transfer_id: TransferId,
        /// Basename of the offered file
        filename: String,
        /// Declared size in bytes
        size: u64,
        /// SHA-256 hex digest of the file contents
        checksum: String,
    },
    /// Accept an offered transfer
    Accept {
        /// Transfer identifier
        transfer_id: TransferId,
    },
    /// Reject an offered transfer
    Reject {
        /// Transfer identifier
        transfer_id: TransferId,
    },
    /// One chunk of file data
    Data {
        /// Transfer identifier
        transfer_id: TransferId,
        /// Strictly monotone chunk index starting at 0
        chunk_index: u64,
        /// Base64-encoded chunk payload
        data: String,
        /// Whether this is the final chunk
        is_last: bool,
    },
    /// Receiver-side confirmation that the digest verified
    Complete {
        /// Transfer identifier
        transfer_id: TransferId,
    },
    /// Abort a non-terminal transfer
    Cancel {
        /// Transfer identifier
        transfer_id: TransferId,
    },
}

/// Encode a chat payload into its wire envelope.
///
/// # Errors
///
/// Returns a serialization error (should not happen for well-formed
/// payloads).
pub fn encode_chat(payload: &ChatPayload) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(payload)
}

/// Decode a chat envelope.
///
/// # Errors
///
/// Fails on malformed JSON, unknown `type` or wrong field types; callers
/// drop the message.
pub fn decode_chat(bytes: &[u8]) -> serde_json::Result<ChatPayload> {
    serde_json::from_slice(bytes)
}

/// Encode a transfer payload into its wire envelope.
///
/// # Errors
///
/// Returns a serialization error (should not happen for well-formed
/// payloads).
pub fn encode_transfer(payload: &TransferPayload) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(payload)
}

/// Decode a transfer envelope.
///
/// # Errors
///
/// Fails on malformed JSON, unknown `type` or wrong field types; callers
/// drop the message.
pub fn decode_transfer(bytes: &[u8]) -> serde_json::Result<TransferPayload> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_envelope_shape() {
        let payload = ChatPayload::Text {
            id: "abc123".to_string(),
            content: "hello".to_string(),
            sender: "Alice".to_string(),
            sender_id: NodeId::from_bytes([1u8; 32]),
            timestamp: 1_700_000_000,
            room_id: "global".to_string(),
            kind: MessageKind::Text,
        };

        let value: serde_json::Value =
            serde_json::from_slice(&encode_chat(&payload).unwrap()).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["data"]["content"], "hello");
        assert_eq!(value["data"]["room_id"], "global");
        assert_eq!(value["data"]["type"], "text");
        assert_eq!(value["data"]["sender"], "Alice");
    }

    #[test]
    fn test_nickname_change_envelope_shape() {
        let payload = ChatPayload::NicknameChange {
            old_nickname: "Alice".to_string(),
            new_nickname: "Alicia".to_string(),
            peer_id: NodeId::from_bytes([2u8; 32]),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&encode_chat(&payload).unwrap()).unwrap();
        assert_eq!(value["type"], "nickname_change");
        assert_eq!(value["data"]["old_nickname"], "Alice");
        assert_eq!(value["data"]["new_nickname"], "Alicia");
    }

    #[test]
    fn test_join_round_trip() {
        let mut participants = HashMap::new();
        participants.insert(NodeId::from_bytes([1u8; 32]), "Alice".to_string());
        participants.insert(NodeId::from_bytes([2u8; 32]), "Bob".to_string());

        let payload = ChatPayload::Join {
            room_id: "global".to_string(),
            room_name: "Global Chat".to_string(),
            room_type: RoomType::Global,
            created_at: 1_700_000_000,
            participants,
        };

        let decoded = decode_chat(&encode_chat(&payload).unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_transfer_data_envelope_shape() {
        let payload = TransferPayload::Data {
            transfer_id: TransferId::from_bytes([7u8; 32]),
            chunk_index: 41,
            data: "aGVsbG8=".to_string(),
            is_last: false,
        };

        let value: serde_json::Value =
            serde_json::from_slice(&encode_transfer(&payload).unwrap()).unwrap();
        assert_eq!(value["type"], "data");
        assert_eq!(value["data"]["chunk_index"], 41);
        assert_eq!(value["data"]["is_last"], false);
        assert_eq!(value["data"]["data"], "aGVsbG8=");
    }

    #[test]
    fn test_offer_round_trip() {
        let payload = TransferPayload::Offer {
            transfer_id: TransferId::from_bytes([9u8; 32]),
            filename: "photo.jpg".to_string(),
            size: 10_485_760,
            checksum: "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
                .to_string(),
        };

        let decoded = decode_transfer(&encode_transfer(&payload).unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let bytes = br#"{"type":"frobnicate","data":{}}"#;
        assert!(decode_chat(bytes).is_err());
        assert!(decode_transfer(bytes).is_err());
    }

    #[test]
    fn test_message_ids_are_unique_enough() {
        let a = message_id();
        let b = message_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }
}
