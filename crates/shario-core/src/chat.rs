//! Chat service.
//!
//! Owns the room graph and speaks `/shario/chat/1.0.0`. The global room is
//! created at start-up with the local node as its only participant; peers
//! reported by the session registry join and leave it automatically. Direct
//! rooms are created lazily on first exchange; local-test rooms never cause
//! network traffic.
//!
//! Nickname propagation: a rename is persisted locally, pushed to every
//! connected peer as a `nickname_change`, and folded into the registry and
//! every room on receipt. When rendering inbound text the registry's current
//! nickname for the sender wins over the nickname stamped in the message,
//! which resolves renames that raced the message in flight.

use crate::error::{NodeError, Result};
use crate::identity::IdentityStore;
use crate::protocol::{self, message_id, unix_now, ChatPayload};
use crate::registry::{RegistryEvent, SessionRegistry};
use crate::room::{
    direct_room_id, Message, MessageKind, Room, RoomType, GLOBAL_ROOM_ID, GLOBAL_ROOM_NAME,
};
use crate::PROTOCOL_CHAT;
use shario_crypto::NodeId;
use shario_transport::TransportHost;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, RwLock};

/// What changed about a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomUpdateKind {
    /// The room was created
    Created,
    /// The participant set or a nickname changed
    Participants,
    /// A message was appended
    LastMessage,
    /// Typing state changed
    Typing,
}

/// Room-update notification.
#[derive(Debug, Clone)]
pub struct RoomUpdate {
    /// The room that changed
    pub room_id: String,
    /// What changed
    pub kind: RoomUpdateKind,
}

struct ChatInner {
    identity: Arc<IdentityStore>,
    registry: SessionRegistry,
    transport: TransportHost,
    rooms: RwLock<HashMap<String, Room>>,
    messages_tx: broadcast::Sender<Message>,
    room_updates_tx: broadcast::Sender<RoomUpdate>,
    typing: Mutex<HashMap<String, HashSet<NodeId>>>,
}

/// The chat service. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ChatInner>,
}

impl ChatService {
    /// Create the chat service and its global room.
    #[must_use]
    pub fn new(
        identity: Arc<IdentityStore>,
        registry: SessionRegistry,
        transport: TransportHost,
    ) -> Self {
        let now = unix_now();
        let mut global = Room::new(
            GLOBAL_ROOM_ID.to_string(),
            GLOBAL_ROOM_NAME.to_string(),
            RoomType::Global,
            now,
        );
        global.upsert_participant(identity.node_id(), identity.nickname());
        global.push_message(Message {
            id: message_id(),
            content: "Welcome to Shario! Peers on your network will appear here.".to_string(),
            sender: "System".to_string(),
            sender_id: identity.node_id(),
            timestamp: now,
            room_id: GLOBAL_ROOM_ID.to_string(),
            kind: MessageKind::System,
        });

        let mut rooms = HashMap::new();
        rooms.insert(GLOBAL_ROOM_ID.to_string(), global);

        let (messages_tx, _) = broadcast::channel(1024);
        let (room_updates_tx, _) = broadcast::channel(1024);

        Self {
            inner: Arc::new(ChatInner {
                identity,
                registry,
                transport,
                rooms: RwLock::new(rooms),
                messages_tx,
                room_updates_tx,
                typing: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to appended messages.
    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.inner.messages_tx.subscribe()
    }

    /// Subscribe to room updates.
    #[must_use]
    pub fn subscribe_room_updates(&self) -> broadcast::Receiver<RoomUpdate> {
        self.inner.room_updates_tx.subscribe()
    }

    /// Start reacting to registry events. Runs until shutdown.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let chat = self.clone();
        let mut events = self.inner.registry.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(RegistryEvent::PeerConnected(peer)) => {
                            chat.handle_peer_connected(peer.node_id, peer.nickname).await;
                        }
                        Some(RegistryEvent::PeerDisconnected(id)) => {
                            chat.handle_peer_disconnected(id).await;
                        }
                        Some(RegistryEvent::Message { peer, protocol, payload }) => {
                            if protocol != PROTOCOL_CHAT {
                                continue;
                            }
                            match protocol::decode_chat(&payload) {
                                Ok(decoded) => chat.handle_payload(peer, decoded).await,
                                Err(e) => {
                                    tracing::debug!(
                                        "dropping malformed chat message from {}: {}",
                                        peer.short(),
                                        e
                                    );
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("chat service stopped");
        });
    }

    async fn handle_peer_connected(&self, peer: NodeId, nickname: String) {
        {
            let mut rooms = self.inner.rooms.write().await;
            let global = rooms.get_mut(GLOBAL_ROOM_ID).expect("global room exists");
            global.upsert_participant(peer, nickname.clone());
        }
        self.emit_update(GLOBAL_ROOM_ID, RoomUpdateKind::Participants);
        self.push_system(GLOBAL_ROOM_ID, format!("{nickname} joined")).await;

        // Offer the newcomer our view of the global room so participants and
        // nicknames sync both ways.
        let join = {
            let rooms = self.inner.rooms.read().await;
            let global = rooms.get(GLOBAL_ROOM_ID).expect("global room exists");
            ChatPayload::Join {
                room_id: global.id.clone(),
                room_name: global.name.clone(),
                room_type: global.kind,
                created_at: global.created_at,
                participants: global.participants.clone(),
            }
        };
        self.send_to_peer(peer, join);
    }

    async fn handle_peer_disconnected(&self, peer: NodeId) {
        let affected: Vec<(String, String)> = {
            let mut rooms = self.inner.rooms.write().await;
            rooms
                .values_mut()
                .filter_map(|room| {
                    let nickname = room.participants.get(&peer).cloned()?;
                    room.remove_participant(&peer);
                    Some((room.id.clone(), nickname))
                })
                .collect()
        };

        {
            let mut typing = self.inner.typing.lock().expect("typing lock");
            for participants in typing.values_mut() {
                participants.remove(&peer);
            }
        }

        for (room_id, nickname) in affected {
            self.emit_update(&room_id, RoomUpdateKind::Participants);
            self.push_system(&room_id, format!("{nickname} left")).await;
        }
    }

    async fn handle_payload(&self, peer: NodeId, payload: ChatPayload) {
        match payload {
            ChatPayload::Text {
                id,
                content,
                sender,
                sender_id,
                timestamp,
                room_id,
                kind,
            } => {
                // Registry nickname wins over the stamped one (rename races).
                // A still-placeholder registry entry is seeded from the stamp
                // instead; the placeholder is only a label until the remote
                // tells us better.
                let display = match self.inner.registry.nickname(&sender_id).await {
                    Some(known) if known != sender_id.short() => known,
                    Some(_) if sender != sender_id.short() => {
                        self.inner.registry.set_nickname(&sender_id, &sender).await;
                        self.rename_everywhere(sender_id, sender.clone()).await;
                        sender
                    }
                    Some(placeholder) => placeholder,
                    None => sender,
                };

                if !self.ensure_room_for_inbound(&room_id, peer).await {
                    tracing::debug!(
                        "dropping text for unknown room {} from {}",
                        room_id,
                        peer.short()
                    );
                    return;
                }

                self.append_message(Message {
                    id,
                    content,
                    sender: display,
                    sender_id,
                    timestamp,
                    room_id,
                    kind,
                })
                .await;
            }
            ChatPayload::Join {
                room_id,
                room_name,
                room_type,
                created_at,
                participants,
            } => {
                self.handle_join(peer, room_id, room_name, room_type, created_at, participants)
                    .await;
            }
            ChatPayload::Leave { room_id } => {
                let nickname = {
                    let mut rooms = self.inner.rooms.write().await;
                    rooms.get_mut(&room_id).and_then(|room| {
                        let nickname = room.participants.get(&peer).cloned();
                        room.remove_participant(&peer);
                        nickname
                    })
                };
                if let Some(nickname) = nickname {
                    self.emit_update(&room_id, RoomUpdateKind::Participants);
                    self.push_system(&room_id, format!("{nickname} left")).await;
                }
            }
            ChatPayload::Typing { room_id, is_typing } => {
                {
                    let mut typing = self.inner.typing.lock().expect("typing lock");
                    let entry = typing.entry(room_id.clone()).or_default();
                    if is_typing {
                        entry.insert(peer);
                    } else {
                        entry.remove(&peer);
                    }
                }
                self.emit_update(&room_id, RoomUpdateKind::Typing);
            }
            ChatPayload::NicknameChange {
                old_nickname,
                new_nickname,
                peer_id,
            } => {
                self.inner.registry.set_nickname(&peer_id, &new_nickname).await;

                let renamed_in: Vec<String> = {
                    let mut rooms = self.inner.rooms.write().await;
                    rooms
                        .values_mut()
                        .filter(|room| room.has_participant(&peer_id))
                        .map(|room| {
                            room.upsert_participant(peer_id, new_nickname.clone());
                            room.id.clone()
                        })
                        .collect()
                };
                for room_id in renamed_in {
                    self.emit_update(&room_id, RoomUpdateKind::Participants);
                }

                self.push_system(
                    GLOBAL_ROOM_ID,
                    format!("{old_nickname} changed their nickname to {new_nickname}"),
                )
                .await;
            }
            ChatPayload::System {
                id,
                content,
                timestamp,
                room_id,
            } => {
                if !self.ensure_room_for_inbound(&room_id, peer).await {
                    return;
                }
                self.append_message(Message {
                    id,
                    content,
                    sender: "System".to_string(),
                    sender_id: peer,
                    timestamp,
                    room_id,
                    kind: MessageKind::System,
                })
                .await;
            }
        }
    }

    async fn handle_join(
        &self,
        peer: NodeId,
        room_id: String,
        room_name: String,
        room_type: RoomType,
        created_at: u64,
        participants: HashMap<NodeId, String>,
    ) {
        // The sender's own entry is authoritative for its nickname.
        if let Some(nickname) = participants.get(&peer) {
            if self.inner.registry.set_nickname(&peer, nickname).await {
                self.rename_everywhere(peer, nickname.clone()).await;
            }
        }

        let mut created = false;
        let mut changed = false;
        {
            let mut rooms = self.inner.rooms.write().await;
            let room = rooms.entry(room_id.clone()).or_insert_with(|| {
                created = true;
                let mut room = Room::new(room_id.clone(), room_name, room_type, created_at);
                room.upsert_participant(
                    self.inner.identity.node_id(),
                    self.inner.identity.nickname(),
                );
                room
            });
            for (id, nickname) in participants {
                changed |= room.upsert_participant(id, nickname);
            }
        }

        if created {
            self.emit_update(&room_id, RoomUpdateKind::Created);
        }
        if changed {
            self.emit_update(&room_id, RoomUpdateKind::Participants);
        }
    }

    /// Accept inbound messages only for rooms we can account for: the global
    /// room, an existing room, or the direct room shared with the sender
    /// (created lazily).
    async fn ensure_room_for_inbound(&self, room_id: &str, peer: NodeId) -> bool {
        {
            let rooms = self.inner.rooms.read().await;
            if rooms.contains_key(room_id) {
                return true;
            }
        }

        let expected_direct = direct_room_id(&self.inner.identity.node_id(), &peer);
        if room_id != expected_direct {
            return false;
        }

        let nickname = self
            .inner
            .registry
            .nickname(&peer)
            .await
            .unwrap_or_else(|| peer.short());
        {
            let mut rooms = self.inner.rooms.write().await;
            let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
                Room::new(
                    room_id.to_string(),
                    nickname.clone(),
                    RoomType::Direct,
                    unix_now(),
                )
            });
            room.upsert_participant(self.inner.identity.node_id(), self.inner.identity.nickname());
            room.upsert_participant(peer, nickname);
        }
        self.emit_update(room_id, RoomUpdateKind::Created);
        true
    }

    async fn rename_everywhere(&self, peer: NodeId, nickname: String) {
        let renamed_in: Vec<String> = {
            let mut rooms = self.inner.rooms.write().await;
            rooms
                .values_mut()
                .filter(|room| room.has_participant(&peer))
                .map(|room| {
                    room.upsert_participant(peer, nickname.clone());
                    room.id.clone()
                })
                .collect()
        };
        for room_id in renamed_in {
            self.emit_update(&room_id, RoomUpdateKind::Participants);
        }
    }

    /// Send a text message to a room.
    ///
    /// The message is appended locally first; delivery to each remote
    /// participant rides its own substream, and a failed delivery drops the
    /// message for that peer only.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::RoomNotFound`] for an unknown room.
    pub async fn send_text(&self, room_id: &str, content: &str) -> Result<Message> {
        let message = Message {
            id: message_id(),
            content: content.to_string(),
            sender: self.inner.identity.nickname(),
            sender_id: self.inner.identity.node_id(),
            timestamp: unix_now(),
            room_id: room_id.to_string(),
            kind: MessageKind::Text,
        };

        let targets = self.remote_targets(room_id).await?;
        self.append_message(message.clone()).await;

        let payload = ChatPayload::Text {
            id: message.id.clone(),
            content: message.content.clone(),
            sender: message.sender.clone(),
            sender_id: message.sender_id,
            timestamp: message.timestamp,
            room_id: message.room_id.clone(),
            kind: MessageKind::Text,
        };
        for peer in targets {
            self.send_to_peer(peer, payload.clone());
        }

        Ok(message)
    }

    /// Send a typing indicator to a room. Not stored.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::RoomNotFound`] for an unknown room.
    pub async fn set_typing(&self, room_id: &str, is_typing: bool) -> Result<()> {
        let targets = self.remote_targets(room_id).await?;
        let payload = ChatPayload::Typing {
            room_id: room_id.to_string(),
            is_typing,
        };
        for peer in targets {
            self.send_to_peer(peer, payload.clone());
        }
        Ok(())
    }

    /// Change the local nickname and propagate it to every connected peer.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::EmptyNickname`] for whitespace-only input, and
    /// I/O errors from the identity rewrite.
    pub async fn change_nickname(&self, nickname: &str) -> Result<()> {
        let old = self.inner.identity.nickname();
        self.inner.identity.set_nickname(nickname)?;
        let new = self.inner.identity.nickname();
        if old == new {
            return Ok(());
        }

        self.rename_everywhere(self.inner.identity.node_id(), new.clone()).await;
        self.push_system(
            GLOBAL_ROOM_ID,
            format!("{old} changed their nickname to {new}"),
        )
        .await;

        let payload = ChatPayload::NicknameChange {
            old_nickname: old,
            new_nickname: new,
            peer_id: self.inner.identity.node_id(),
        };
        for peer in self.inner.registry.peers().await {
            self.send_to_peer(peer.node_id, payload.clone());
        }

        Ok(())
    }

    /// Open (or return) the direct room with a connected peer.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] if the peer is not connected.
    pub async fn open_direct_room(&self, peer: NodeId) -> Result<String> {
        let Some(entry) = self.inner.registry.peer(&peer).await else {
            return Err(NodeError::PeerNotFound(peer));
        };

        let room_id = direct_room_id(&self.inner.identity.node_id(), &peer);
        let mut created = false;
        {
            let mut rooms = self.inner.rooms.write().await;
            rooms.entry(room_id.clone()).or_insert_with(|| {
                created = true;
                let mut room = Room::new(
                    room_id.clone(),
                    entry.nickname.clone(),
                    RoomType::Direct,
                    unix_now(),
                );
                room.upsert_participant(
                    self.inner.identity.node_id(),
                    self.inner.identity.nickname(),
                );
                room.upsert_participant(peer, entry.nickname.clone());
                room
            });
        }

        if created {
            self.emit_update(&room_id, RoomUpdateKind::Created);

            let join = {
                let rooms = self.inner.rooms.read().await;
                let room = rooms.get(&room_id).expect("just inserted");
                ChatPayload::Join {
                    room_id: room.id.clone(),
                    room_name: room.name.clone(),
                    room_type: room.kind,
                    created_at: room.created_at,
                    participants: room.participants.clone(),
                }
            };
            self.send_to_peer(peer, join);
        }

        Ok(room_id)
    }

    /// Create a local-test room. Never causes network traffic.
    pub async fn create_local_test_room(&self, name: &str) -> String {
        let room_id = format!("local-{}", message_id());
        {
            let mut rooms = self.inner.rooms.write().await;
            let mut room = Room::new(
                room_id.clone(),
                name.to_string(),
                RoomType::LocalTest,
                unix_now(),
            );
            room.upsert_participant(self.inner.identity.node_id(), self.inner.identity.nickname());
            rooms.insert(room_id.clone(), room);
        }
        self.emit_update(&room_id, RoomUpdateKind::Created);
        room_id
    }

    /// Snapshot of one room.
    pub async fn room(&self, room_id: &str) -> Option<Room> {
        self.inner.rooms.read().await.get(room_id).cloned()
    }

    /// Snapshot of all rooms.
    pub async fn rooms(&self) -> Vec<Room> {
        self.inner.rooms.read().await.values().cloned().collect()
    }

    /// Reset a room's unread counter.
    pub async fn mark_read(&self, room_id: &str) {
        if let Some(room) = self.inner.rooms.write().await.get_mut(room_id) {
            room.mark_read();
        }
    }

    /// Peers currently typing in a room.
    #[must_use]
    pub fn typing_in(&self, room_id: &str) -> Vec<NodeId> {
        self.inner
            .typing
            .lock()
            .expect("typing lock")
            .get(room_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remote recipients for a room send.
    async fn remote_targets(&self, room_id: &str) -> Result<Vec<NodeId>> {
        let (kind, participants) = {
            let rooms = self.inner.rooms.read().await;
            let room = rooms
                .get(room_id)
                .ok_or_else(|| NodeError::RoomNotFound(room_id.to_string()))?;
            (room.kind, room.participants.keys().copied().collect::<Vec<_>>())
        };

        let local = self.inner.identity.node_id();
        Ok(match kind {
            // The global room reaches every connected peer.
            RoomType::Global => self
                .inner
                .registry
                .peers()
                .await
                .into_iter()
                .map(|p| p.node_id)
                .collect(),
            RoomType::Direct => participants.into_iter().filter(|id| *id != local).collect(),
            RoomType::LocalTest => Vec::new(),
        })
    }

    async fn append_message(&self, message: Message) {
        let room_id = message.room_id.clone();
        {
            let mut rooms = self.inner.rooms.write().await;
            if let Some(room) = rooms.get_mut(&room_id) {
                room.push_message(message.clone());
            } else {
                return;
            }
        }
        let _ = self.inner.messages_tx.send(message);
        self.emit_update(&room_id, RoomUpdateKind::LastMessage);
    }

    async fn push_system(&self, room_id: &str, content: String) {
        self.append_message(Message {
            id: message_id(),
            content,
            sender: "System".to_string(),
            sender_id: self.inner.identity.node_id(),
            timestamp: unix_now(),
            room_id: room_id.to_string(),
            kind: MessageKind::System,
        })
        .await;
    }

    /// Fire-and-forget a payload to one peer on a fresh substream.
    fn send_to_peer(&self, peer: NodeId, payload: ChatPayload) {
        let transport = self.inner.transport.clone();
        tokio::spawn(async move {
            let bytes = match protocol::encode_chat(&payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("chat payload encoding failed: {}", e);
                    return;
                }
            };
            if let Err(e) = transport.send(peer, PROTOCOL_CHAT, bytes).await {
                tracing::debug!("chat message to {} dropped: {}", peer.short(), e);
            }
        });
    }

    fn emit_update(&self, room_id: &str, kind: RoomUpdateKind) {
        let _ = self.inner.room_updates_tx.send(RoomUpdate {
            room_id: room_id.to_string(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::{OsRng, RngCore};
    use shario_crypto::signatures::SigningKey;
    use shario_transport::{TransportConfig, TransportEvent};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        chat: ChatService,
        registry: SessionRegistry,
        transport_tx: mpsc::Sender<TransportEvent>,
        _shutdown_tx: watch::Sender<bool>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let identity = Arc::new(IdentityStore::open(dir.path(), "chat-test").unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let (event_tx, _event_rx) = mpsc::channel(64);
        let transport = TransportHost::new(
            identity.signing_key(),
            TransportConfig::default(),
            event_tx,
            shutdown_rx.clone(),
        );

        let registry = SessionRegistry::new(transport.clone());
        let chat = ChatService::new(identity, registry.clone(), transport);
        chat.start(shutdown_rx.clone());
        registry.run(transport_rx, shutdown_rx);

        Harness {
            chat,
            registry,
            transport_tx,
            _shutdown_tx: shutdown_tx,
            _dir: dir,
        }
    }

    fn random_node_id() -> NodeId {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        NodeId::from_bytes(bytes)
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    async fn connect_peer(harness: &Harness, peer: NodeId) {
        harness
            .transport_tx
            .send(TransportEvent::ConnectionOpened {
                peer,
                addr: "127.0.0.1:9999".parse().unwrap(),
            })
            .await
            .unwrap();
        let chat = harness.chat.clone();
        wait_until(|| {
            let chat = chat.clone();
            async move {
                chat.room(GLOBAL_ROOM_ID)
                    .await
                    .unwrap()
                    .has_participant(&peer)
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_global_room_exists_with_welcome() {
        let harness = harness();
        let global = harness.chat.room(GLOBAL_ROOM_ID).await.unwrap();

        assert_eq!(global.kind, RoomType::Global);
        assert_eq!(global.participants.len(), 1);
        assert_eq!(global.messages.len(), 1);
        assert_eq!(global.messages[0].kind, MessageKind::System);
    }

    #[tokio::test]
    async fn test_peer_connect_joins_global_room() {
        let harness = harness();
        let peer = random_node_id();
        connect_peer(&harness, peer).await;

        let global = harness.chat.room(GLOBAL_ROOM_ID).await.unwrap();
        assert_eq!(global.participants[&peer], peer.short());
        assert!(global
            .messages
            .iter()
            .any(|m| m.kind == MessageKind::System && m.content.contains("joined")));
    }

    #[tokio::test]
    async fn test_peer_disconnect_leaves_global_room() {
        let harness = harness();
        let peer = random_node_id();
        connect_peer(&harness, peer).await;

        harness
            .transport_tx
            .send(TransportEvent::ConnectionClosed {
                peer,
                addr: "127.0.0.1:9999".parse().unwrap(),
            })
            .await
            .unwrap();

        let chat = harness.chat.clone();
        wait_until(|| {
            let chat = chat.clone();
            async move {
                !chat
                    .room(GLOBAL_ROOM_ID)
                    .await
                    .unwrap()
                    .has_participant(&peer)
            }
        })
        .await;

        let global = harness.chat.room(GLOBAL_ROOM_ID).await.unwrap();
        assert!(global
            .messages
            .iter()
            .any(|m| m.kind == MessageKind::System && m.content.contains("left")));
    }

    #[tokio::test]
    async fn test_inbound_text_uses_registry_nickname() {
        let harness = harness();
        let peer = random_node_id();
        connect_peer(&harness, peer).await;

        // The peer renamed; the registry knows, but the in-flight message
        // still carries the old nickname.
        harness.registry.set_nickname(&peer, "Alicia").await;

        let payload = ChatPayload::Text {
            id: "m-1".to_string(),
            content: "hello".to_string(),
            sender: "Alice".to_string(),
            sender_id: peer,
            timestamp: unix_now(),
            room_id: GLOBAL_ROOM_ID.to_string(),
            kind: MessageKind::Text,
        };
        harness
            .transport_tx
            .send(TransportEvent::Message {
                peer,
                protocol: PROTOCOL_CHAT.to_string(),
                payload: protocol::encode_chat(&payload).unwrap(),
            })
            .await
            .unwrap();

        let chat = harness.chat.clone();
        wait_until(|| {
            let chat = chat.clone();
            async move {
                chat.room(GLOBAL_ROOM_ID)
                    .await
                    .unwrap()
                    .messages
                    .iter()
                    .any(|m| m.content == "hello")
            }
        })
        .await;

        let global = harness.chat.room(GLOBAL_ROOM_ID).await.unwrap();
        let message = global
            .messages
            .iter()
            .find(|m| m.content == "hello")
            .unwrap();
        assert_eq!(message.sender, "Alicia");
        assert_eq!(message.sender_id, peer);
    }

    #[tokio::test]
    async fn test_inbound_nickname_change_updates_rooms_and_registry() {
        let harness = harness();
        let peer = random_node_id();
        connect_peer(&harness, peer).await;

        let payload = ChatPayload::NicknameChange {
            old_nickname: "Alice".to_string(),
            new_nickname: "Alicia".to_string(),
            peer_id: peer,
        };
        harness
            .transport_tx
            .send(TransportEvent::Message {
                peer,
                protocol: PROTOCOL_CHAT.to_string(),
                payload: protocol::encode_chat(&payload).unwrap(),
            })
            .await
            .unwrap();

        let chat = harness.chat.clone();
        wait_until(|| {
            let chat = chat.clone();
            async move {
                chat.room(GLOBAL_ROOM_ID).await.unwrap().participants[&peer] == "Alicia"
            }
        })
        .await;

        assert_eq!(harness.registry.nickname(&peer).await.unwrap(), "Alicia");
        let global = harness.chat.room(GLOBAL_ROOM_ID).await.unwrap();
        assert!(global.messages.iter().any(|m| m
            .content
            .contains("Alice changed their nickname to Alicia")));
    }

    #[tokio::test]
    async fn test_local_nickname_change_appends_system_message() {
        let harness = harness();

        harness.chat.change_nickname("Alicia").await.unwrap();

        let global = harness.chat.room(GLOBAL_ROOM_ID).await.unwrap();
        let local_id = global
            .participants
            .iter()
            .find(|(_, nick)| *nick == "Alicia")
            .map(|(id, _)| *id);
        assert!(local_id.is_some(), "local participant should be renamed");
        assert!(global.messages.iter().any(|m| m
            .content
            .contains("Anonymous changed their nickname to Alicia")));
    }

    #[tokio::test]
    async fn test_inbound_direct_text_creates_direct_room() {
        let harness = harness();
        let peer = random_node_id();
        connect_peer(&harness, peer).await;

        let local_id = {
            let global = harness.chat.room(GLOBAL_ROOM_ID).await.unwrap();
            *global
                .participants
                .keys()
                .find(|id| **id != peer)
                .unwrap()
        };
        let room_id = direct_room_id(&local_id, &peer);

        let payload = ChatPayload::Text {
            id: "m-2".to_string(),
            content: "psst".to_string(),
            sender: "Alice".to_string(),
            sender_id: peer,
            timestamp: unix_now(),
            room_id: room_id.clone(),
            kind: MessageKind::Text,
        };
        harness
            .transport_tx
            .send(TransportEvent::Message {
                peer,
                protocol: PROTOCOL_CHAT.to_string(),
                payload: protocol::encode_chat(&payload).unwrap(),
            })
            .await
            .unwrap();

        let chat = harness.chat.clone();
        let expect = room_id.clone();
        wait_until(|| {
            let chat = chat.clone();
            let expect = expect.clone();
            async move { chat.room(&expect).await.is_some() }
        })
        .await;

        let room = harness.chat.room(&room_id).await.unwrap();
        assert_eq!(room.kind, RoomType::Direct);
        assert_eq!(room.participants.len(), 2);
        assert_eq!(room.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_text_to_unknown_room_is_dropped() {
        let harness = harness();
        let peer = random_node_id();
        connect_peer(&harness, peer).await;

        let payload = ChatPayload::Text {
            id: "m-3".to_string(),
            content: "lost".to_string(),
            sender: "Alice".to_string(),
            sender_id: peer,
            timestamp: unix_now(),
            room_id: "no-such-room".to_string(),
            kind: MessageKind::Text,
        };
        harness
            .transport_tx
            .send(TransportEvent::Message {
                peer,
                protocol: PROTOCOL_CHAT.to_string(),
                payload: protocol::encode_chat(&payload).unwrap(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.chat.room("no-such-room").await.is_none());
    }

    #[tokio::test]
    async fn test_local_test_room_is_isolated() {
        let harness = harness();

        let room_id = harness.chat.create_local_test_room("sandbox").await;
        let room = harness.chat.room(&room_id).await.unwrap();
        assert_eq!(room.kind, RoomType::LocalTest);

        // Sending into it succeeds with no remote targets.
        harness.chat.send_text(&room_id, "just me").await.unwrap();
        let room = harness.chat.room(&room_id).await.unwrap();
        assert_eq!(room.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_send_text_to_missing_room_fails() {
        let harness = harness();
        let err = harness.chat.send_text("missing", "hi").await.unwrap_err();
        assert!(matches!(err, NodeError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_unread_and_mark_read() {
        let harness = harness();

        harness.chat.send_text(GLOBAL_ROOM_ID, "one").await.unwrap();
        harness.chat.send_text(GLOBAL_ROOM_ID, "two").await.unwrap();

        let global = harness.chat.room(GLOBAL_ROOM_ID).await.unwrap();
        assert!(global.unread >= 2);

        harness.chat.mark_read(GLOBAL_ROOM_ID).await;
        assert_eq!(harness.chat.room(GLOBAL_ROOM_ID).await.unwrap().unread, 0);
    }
}
