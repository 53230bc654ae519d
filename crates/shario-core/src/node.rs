//! Node coordinator.
//!
//! Owns the identity store, transport host, session registry, chat service,
//! transfer manager and discovery manager, and the root shutdown watch that
//! every loop observes. Discovery surfaces dialable addresses; the node's
//! dial loop feeds them into the transport; the registry collapses the
//! resulting connections into logical peers the application layers react to.

use crate::chat::{ChatService, RoomUpdate};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::identity::IdentityStore;
use crate::registry::{Peer, SessionRegistry};
use crate::room::{Message, Room};
use crate::transfer::{OfferHandler, Transfer, TransferId, TransferManager, TransferStatus};
use shario_crypto::NodeId;
use shario_discovery::manager::advertise_addrs;
use shario_discovery::DiscoveryManager;
use shario_transport::{PeerAddr, TransportHost};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};

struct NodeInner {
    config: NodeConfig,
    identity: Arc<IdentityStore>,
    transport: TransportHost,
    registry: SessionRegistry,
    chat: ChatService,
    transfers: TransferManager,
    discovery: DiscoveryManager,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    transport_events: Mutex<Option<mpsc::Receiver<shario_transport::TransportEvent>>>,
    found_peers: Mutex<Option<mpsc::Receiver<PeerAddr>>>,
}

/// A Shario node. Cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Build a node from configuration.
    ///
    /// Loads or generates the identity and binds the discovery endpoints,
    /// but opens no listeners and dials nobody until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Start-up errors are fatal: an unusable config directory, a corrupt
    /// or tampered identity file.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let config_dir = config.resolve_config_dir()?;
        let process_tag = config.resolve_process_tag();
        let identity = Arc::new(IdentityStore::open(&config_dir, &process_tag)?);
        let downloads_dir = config.resolve_downloads_dir()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (transport_event_tx, transport_event_rx) = mpsc::channel(256);
        let transport = TransportHost::new(
            identity.signing_key(),
            config.transport.clone(),
            transport_event_tx,
            shutdown_rx.clone(),
        );

        let registry = SessionRegistry::new(transport.clone());
        let chat = ChatService::new(Arc::clone(&identity), registry.clone(), transport.clone());
        let transfers = TransferManager::new(transport.clone(), downloads_dir);

        let (found_tx, found_rx) = mpsc::channel(256);
        let discovery = DiscoveryManager::new(
            identity.node_id(),
            config.discovery.clone(),
            found_tx,
            shutdown_rx,
        )
        .await?;

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                identity,
                transport,
                registry,
                chat,
                transfers,
                discovery,
                shutdown_tx,
                started: AtomicBool::new(false),
                transport_events: Mutex::new(Some(transport_event_rx)),
                found_peers: Mutex::new(Some(found_rx)),
            }),
        })
    }

    /// Start the node: listeners, event loops, discovery, the dial loop.
    ///
    /// Idempotent; a second call returns the current listen addresses.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the listeners cannot bind.
    pub async fn start(&self) -> Result<Vec<PeerAddr>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(self.inner.transport.listen_addrs());
        }

        let shutdown = self.inner.shutdown_tx.subscribe();

        // Application layers subscribe to the registry before it starts
        // consuming transport events, so no early peer is missed.
        self.inner.chat.start(shutdown.clone());
        self.inner.transfers.start(&self.inner.registry, shutdown.clone());

        let transport_events = self
            .inner
            .transport_events
            .lock()
            .expect("events lock")
            .take()
            .expect("start called once");
        self.inner.registry.run(transport_events, shutdown.clone());

        let addrs = self.inner.transport.listen().await?;
        tracing::info!(
            "node {} listening on {} address(es)",
            self.inner.identity.node_id().short(),
            addrs.len()
        );

        self.inner.discovery.start(advertise_addrs(&addrs));

        let found_peers = self
            .inner
            .found_peers
            .lock()
            .expect("found lock")
            .take()
            .expect("start called once");
        self.spawn_dial_loop(found_peers, shutdown);

        Ok(addrs)
    }

    /// Dial every address discovery surfaces; failures are logged and the
    /// next discovery cycle retries.
    fn spawn_dial_loop(
        &self,
        mut found: mpsc::Receiver<PeerAddr>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let transport = self.inner.transport.clone();
        let local = self.inner.identity.node_id();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    peer = found.recv() => match peer {
                        Some(peer) => {
                            if peer.node_id == local || transport.is_connected(peer.node_id) {
                                continue;
                            }
                            tracing::debug!("dialing discovered peer {}", peer);
                            if let Err(e) = transport.dial(&peer).await {
                                tracing::debug!("dial of {} failed: {}", peer, e);
                            }
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("dial loop stopped");
        });
    }

    /// Stop the node.
    ///
    /// Flips the root shutdown watch (closing listeners, connections and
    /// discovery loops) and cancels every non-terminal transfer so file
    /// handles are released.
    pub async fn stop(&self) {
        tracing::info!("node {} stopping", self.inner.identity.node_id().short());
        let _ = self.inner.shutdown_tx.send(true);

        for transfer in self.inner.transfers.transfers().await {
            if !transfer.status.is_terminal() {
                let _ = self.inner.transfers.cancel(transfer.id).await;
            }
        }
    }

    // ============ Identity ============

    /// The local node identifier.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.identity.node_id()
    }

    /// The current local nickname.
    #[must_use]
    pub fn nickname(&self) -> String {
        self.inner.identity.nickname()
    }

    /// Change the local nickname: persists it and propagates the change to
    /// every connected peer.
    ///
    /// # Errors
    ///
    /// Rejects whitespace-only nicknames; propagates identity-file I/O
    /// errors.
    pub async fn set_nickname(&self, nickname: &str) -> Result<()> {
        self.inner.chat.change_nickname(nickname).await
    }

    /// Export the identity, private key included.
    ///
    /// # Errors
    ///
    /// Serialization errors only.
    pub fn export_identity(&self) -> Result<Vec<u8>> {
        self.inner.identity.export()
    }

    /// Import an identity into a config directory for later [`Node::new`]
    /// runs with the same tag. Fails if the serialized identifier does not
    /// re-derive from the key material.
    ///
    /// # Errors
    ///
    /// Propagates [`IdentityStore::import`] failures.
    pub fn import_identity(config_dir: &Path, process_tag: &str, bytes: &[u8]) -> Result<()> {
        IdentityStore::import(config_dir, process_tag, bytes).map(|_| ())
    }

    // ============ Peers and transport ============

    /// Current listen addresses (with identifier suffix).
    #[must_use]
    pub fn listen_addrs(&self) -> Vec<PeerAddr> {
        self.inner.transport.listen_addrs()
    }

    /// Connected logical peers.
    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.registry.peers().await
    }

    /// Dial a peer address directly, outside discovery.
    ///
    /// # Errors
    ///
    /// Propagates transport dial failures.
    pub async fn dial(&self, addr: &PeerAddr) -> Result<()> {
        self.inner.transport.dial(addr).await?;
        Ok(())
    }

    // ============ Chat ============

    /// Send a text message to a room.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown rooms.
    pub async fn send_text(&self, room_id: &str, content: &str) -> Result<Message> {
        self.inner.chat.send_text(room_id, content).await
    }

    /// Send a typing indicator to a room.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown rooms.
    pub async fn set_typing(&self, room_id: &str, is_typing: bool) -> Result<()> {
        self.inner.chat.set_typing(room_id, is_typing).await
    }

    /// Open (or fetch) the direct room with a connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not connected.
    pub async fn open_direct_room(&self, peer: NodeId) -> Result<String> {
        self.inner.chat.open_direct_room(peer).await
    }

    /// Create a local-test room (no network traffic).
    pub async fn create_local_test_room(&self, name: &str) -> String {
        self.inner.chat.create_local_test_room(name).await
    }

    /// Snapshot of one room.
    pub async fn room(&self, room_id: &str) -> Option<Room> {
        self.inner.chat.room(room_id).await
    }

    /// Snapshot of all rooms.
    pub async fn rooms(&self) -> Vec<Room> {
        self.inner.chat.rooms().await
    }

    /// Reset a room's unread counter.
    pub async fn mark_read(&self, room_id: &str) {
        self.inner.chat.mark_read(room_id).await;
    }

    /// Subscribe to appended messages.
    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.inner.chat.subscribe_messages()
    }

    /// Subscribe to room updates.
    #[must_use]
    pub fn subscribe_room_updates(&self) -> broadcast::Receiver<RoomUpdate> {
        self.inner.chat.subscribe_room_updates()
    }

    // ============ Transfers ============

    /// Register the inbound-offer decision handler.
    pub fn set_offer_handler(&self, handler: OfferHandler) {
        self.inner.transfers.set_offer_handler(handler);
    }

    /// Offer a file to a connected peer.
    ///
    /// # Errors
    ///
    /// Propagates [`TransferManager::send_file`] failures.
    pub async fn send_file(&self, peer: NodeId, path: impl AsRef<Path>) -> Result<TransferId> {
        self.inner.transfers.send_file(peer, path).await
    }

    /// Cancel a transfer.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown transfer identifiers.
    pub async fn cancel_transfer(&self, id: TransferId) -> Result<()> {
        self.inner.transfers.cancel(id).await
    }

    /// Snapshot of one transfer.
    pub async fn transfer(&self, id: TransferId) -> Option<Transfer> {
        self.inner.transfers.transfer(id).await
    }

    /// Snapshots of all transfers.
    pub async fn transfers(&self) -> Vec<Transfer> {
        self.inner.transfers.transfers().await
    }

    /// Subscribe to transfer snapshots.
    #[must_use]
    pub fn subscribe_transfers(&self) -> broadcast::Receiver<Transfer> {
        self.inner.transfers.subscribe()
    }

    /// Number of distinct peers discovery has surfaced.
    #[must_use]
    pub fn discovered_count(&self) -> usize {
        self.inner.discovery.discovered_count()
    }

    /// The node configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.inner.identity.node_id().short())
            .field("nickname", &self.inner.identity.nickname())
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shario_discovery::DiscoveryConfig;
    use tempfile::TempDir;

    fn quiet_config(dir: &TempDir, tag: &str) -> NodeConfig {
        NodeConfig {
            config_dir: Some(dir.path().join("config")),
            downloads_dir: Some(dir.path().join("downloads")),
            process_tag: Some(tag.to_string()),
            discovery: DiscoveryConfig {
                enable_multicast: false,
                enable_dht: false,
                ..DiscoveryConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_node_identity_is_stable_across_restarts() {
        let dir = TempDir::new().unwrap();

        let node = Node::new(quiet_config(&dir, "n1")).await.unwrap();
        let id = node.node_id();
        node.stop().await;

        let reborn = Node::new(quiet_config(&dir, "n1")).await.unwrap();
        assert_eq!(reborn.node_id(), id);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(quiet_config(&dir, "n2")).await.unwrap();

        let first = node.start().await.unwrap();
        assert!(!first.is_empty());

        let second = node.start().await.unwrap();
        assert_eq!(first.len(), second.len());

        node.stop().await;
    }

    #[tokio::test]
    async fn test_global_room_is_ready_before_start() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(quiet_config(&dir, "n3")).await.unwrap();

        let global = node.room(crate::room::GLOBAL_ROOM_ID).await.unwrap();
        assert!(global.has_participant(&node.node_id()));
    }
}
