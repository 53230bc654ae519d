//! Session registry.
//!
//! Collapses the transport's per-connection notifications into one logical
//! peer per node identifier. Whatever mix of dual-stack dials, crossed dials
//! and reconnect churn the transport produces, subscribers observe exactly
//! one `PeerConnected` and one `PeerDisconnected` per identifier per logical
//! session.

use crate::protocol::unix_now;
use shario_crypto::NodeId;
use shario_transport::{TransportEvent, TransportHost};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::{mpsc, watch, RwLock};

/// A logical peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Node identifier (the immutable key)
    pub node_id: NodeId,
    /// Last known nickname; starts as an identifier prefix placeholder
    pub nickname: String,
    /// Unix seconds of the first connection
    pub connected_at: u64,
    /// Remote addresses of the currently live connections
    pub addrs: Vec<SocketAddr>,
}

/// Events emitted to registry subscribers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A logical peer came online (exactly once per logical session)
    PeerConnected(Peer),
    /// A logical peer went offline (exactly once per logical session)
    PeerDisconnected(NodeId),
    /// An inbound substream message from a connected peer
    Message {
        /// Sending peer
        peer: NodeId,
        /// Substream protocol name
        protocol: String,
        /// Message payload
        payload: Arc<Vec<u8>>,
    },
}

struct RegistryInner {
    peers: RwLock<HashMap<NodeId, Peer>>,
    subscribers: StdRwLock<Vec<mpsc::Sender<RegistryEvent>>>,
    transport: TransportHost,
}

/// The session registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry over the given transport host.
    #[must_use]
    pub fn new(transport: TransportHost) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                peers: RwLock::new(HashMap::new()),
                subscribers: StdRwLock::new(Vec::new()),
                transport,
            }),
        }
    }

    /// Subscribe to registry events over a bounded channel.
    ///
    /// Delivery is lossless: a subscriber that stops draining stalls the
    /// event pipeline, which in turn backpressures the transport. Subscribe
    /// before the registry starts consuming transport events or early peers
    /// will be missed.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<RegistryEvent> {
        let (tx, rx) = mpsc::channel(512);
        self.inner
            .subscribers
            .write()
            .expect("subscriber lock")
            .push(tx);
        rx
    }

    /// Deliver an event to every subscriber, dropping closed channels.
    async fn emit(&self, event: RegistryEvent) {
        let senders: Vec<mpsc::Sender<RegistryEvent>> = self
            .inner
            .subscribers
            .read()
            .expect("subscriber lock")
            .clone();

        let mut any_closed = false;
        for sender in &senders {
            if sender.send(event.clone()).await.is_err() {
                any_closed = true;
            }
        }
        if any_closed {
            self.inner
                .subscribers
                .write()
                .expect("subscriber lock")
                .retain(|s| !s.is_closed());
        }
    }

    /// Start consuming transport events. Runs until shutdown.
    pub fn run(
        &self,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = transport_events.recv() => match event {
                        Some(event) => registry.handle_transport_event(event).await,
                        None => break,
                    }
                }
            }
            tracing::debug!("session registry stopped");
        });
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionOpened { peer, addr } => {
                let mut peers = self.inner.peers.write().await;
                if let Some(existing) = peers.get_mut(&peer) {
                    // The logical peer is already connected; just record the
                    // extra path.
                    if !existing.addrs.contains(&addr) {
                        existing.addrs.push(addr);
                    }
                    tracing::debug!(
                        "additional connection to {} via {} ({} total)",
                        peer.short(),
                        addr,
                        existing.addrs.len()
                    );
                } else {
                    let entry = Peer {
                        node_id: peer,
                        nickname: peer.short(),
                        connected_at: unix_now(),
                        addrs: vec![addr],
                    };
                    peers.insert(peer, entry.clone());
                    drop(peers);
                    tracing::info!("peer {} connected via {}", peer.short(), addr);
                    self.emit(RegistryEvent::PeerConnected(entry)).await;
                }
            }
            TransportEvent::ConnectionClosed { peer, addr } => {
                if self.inner.transport.is_connected(peer) {
                    // Another session remains; the logical peer stays.
                    let mut peers = self.inner.peers.write().await;
                    if let Some(existing) = peers.get_mut(&peer) {
                        existing.addrs.retain(|a| *a != addr);
                    }
                    tracing::debug!(
                        "connection to {} via {} closed, peer still reachable",
                        peer.short(),
                        addr
                    );
                } else {
                    let removed = self.inner.peers.write().await.remove(&peer);
                    if removed.is_some() {
                        tracing::info!("peer {} disconnected", peer.short());
                        self.emit(RegistryEvent::PeerDisconnected(peer)).await;
                    }
                }
            }
            TransportEvent::Message {
                peer,
                protocol,
                payload,
            } => {
                self.emit(RegistryEvent::Message {
                    peer,
                    protocol,
                    payload: Arc::new(payload),
                })
                .await;
            }
        }
    }

    /// Snapshot of a peer.
    pub async fn peer(&self, id: &NodeId) -> Option<Peer> {
        self.inner.peers.read().await.get(id).cloned()
    }

    /// Snapshot of all connected peers.
    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.peers.read().await.values().cloned().collect()
    }

    /// Number of connected logical peers.
    pub async fn peer_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Current nickname for an identifier, if connected.
    pub async fn nickname(&self, id: &NodeId) -> Option<String> {
        self.inner.peers.read().await.get(id).map(|p| p.nickname.clone())
    }

    /// Update a peer's nickname. Returns true if the peer was known.
    pub async fn set_nickname(&self, id: &NodeId, nickname: &str) -> bool {
        let mut peers = self.inner.peers.write().await;
        if let Some(peer) = peers.get_mut(id) {
            peer.nickname = nickname.to_string();
            true
        } else {
            false
        }
    }
}
