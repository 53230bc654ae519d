//! DHT service: UDP endpoint, RPC correlation and the Kademlia operations.

use super::dht_id::DhtId;
use super::messages::{DhtMessage, PeerContact, ProviderRecord};
use super::routing::{DhtPeer, RoutingTable};
use super::{ALPHA, K, MAX_ITERATIONS, PROVIDER_TTL};
use crate::error::{DiscoveryError, Result};
use dashmap::DashMap;
use shario_crypto::NodeId;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};

/// DHT configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// UDP bind address (port 0 = ephemeral)
    pub bind_addr: SocketAddr,
    /// Per-RPC response deadline
    pub request_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().expect("static addr"),
            request_timeout: Duration::from_secs(5),
        }
    }
}

struct DhtInner {
    local: PeerContact,
    id: DhtId,
    socket: UdpSocket,
    routing: Mutex<RoutingTable>,
    providers: Mutex<HashMap<DhtId, HashMap<NodeId, (ProviderRecord, Instant)>>>,
    pending: DashMap<u64, oneshot::Sender<DhtMessage>>,
    request_timeout: Duration,
}

/// The DHT endpoint of a node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DhtService {
    inner: Arc<DhtInner>,
}

impl DhtService {
    /// Bind the DHT endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the UDP socket cannot be bound.
    pub async fn bind(node_id: NodeId, config: DhtConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let id = DhtId::from_node_id(&node_id);

        tracing::debug!("DHT endpoint bound on {}", local_addr);

        Ok(Self {
            inner: Arc::new(DhtInner {
                local: PeerContact {
                    node_id,
                    addr: local_addr,
                },
                id,
                socket,
                routing: Mutex::new(RoutingTable::new(id)),
                providers: Mutex::new(HashMap::new()),
                pending: DashMap::new(),
                request_timeout: config.request_timeout,
            }),
        })
    }

    /// The UDP address this endpoint is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local.addr
    }

    /// Number of peers in the routing table.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.routing.lock().expect("routing lock").peer_count()
    }

    /// Whether the routing table is still empty.
    #[must_use]
    pub fn routing_is_empty(&self) -> bool {
        self.inner.routing.lock().expect("routing lock").is_empty()
    }

    /// Start the receive loop. Runs until the shutdown watch flips.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = service.inner.socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            match serde_json::from_slice::<DhtMessage>(&buf[..len]) {
                                Ok(msg) => service.handle_message(msg, from).await,
                                Err(e) => {
                                    tracing::debug!("malformed DHT message from {}: {}", from, e);
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!("DHT socket receive failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("DHT receive loop stopped");
        });
    }

    async fn handle_message(&self, msg: DhtMessage, from: SocketAddr) {
        // Learn the sender under its observed address, never the claimed one.
        let sender_id = msg.sender().node_id;
        if sender_id != self.inner.local.node_id {
            self.inner
                .routing
                .lock()
                .expect("routing lock")
                .upsert(DhtPeer::new(sender_id, from));
        }

        if msg.is_response() {
            if let Some((_, tx)) = self.inner.pending.remove(&msg.nonce()) {
                let _ = tx.send(msg);
            }
            return;
        }

        let reply = match msg {
            DhtMessage::Ping { nonce, .. } => DhtMessage::Pong {
                sender: self.inner.local,
                nonce,
            },
            DhtMessage::FindNode { nonce, target, .. } => {
                let peers = self
                    .closest_contacts(&target)
                    .into_iter()
                    .filter(|c| c.node_id != sender_id)
                    .collect();
                DhtMessage::Nodes {
                    sender: self.inner.local,
                    nonce,
                    peers,
                }
            }
            DhtMessage::Provide {
                nonce, key, record, ..
            } => {
                self.store_provider(key, record);
                DhtMessage::ProvideAck {
                    sender: self.inner.local,
                    nonce,
                }
            }
            DhtMessage::GetProviders { nonce, key, .. } => DhtMessage::Providers {
                sender: self.inner.local,
                nonce,
                providers: self.local_providers(&key),
                closer: self.closest_contacts(&key),
            },
            // Responses are handled above.
            _ => return,
        };

        if let Ok(bytes) = serde_json::to_vec(&reply) {
            if let Err(e) = self.inner.socket.send_to(&bytes, from).await {
                tracing::debug!("DHT reply to {} failed: {}", from, e);
            }
        }
    }

    fn closest_contacts(&self, target: &DhtId) -> Vec<PeerContact> {
        self.inner
            .routing
            .lock()
            .expect("routing lock")
            .closest(target, K)
            .into_iter()
            .map(|p| PeerContact {
                node_id: p.node_id,
                addr: p.addr,
            })
            .collect()
    }

    /// Store a provider record under a key, dropping expired entries.
    fn store_provider(&self, key: DhtId, record: ProviderRecord) {
        let mut providers = self.inner.providers.lock().expect("providers lock");
        let now = Instant::now();

        for records in providers.values_mut() {
            records.retain(|_, (_, stored)| now.duration_since(*stored) < PROVIDER_TTL);
        }

        providers
            .entry(key)
            .or_default()
            .insert(record.node_id, (record, now));
    }

    /// Valid local provider records for a key.
    fn local_providers(&self, key: &DhtId) -> Vec<ProviderRecord> {
        let providers = self.inner.providers.lock().expect("providers lock");
        let now = Instant::now();

        providers
            .get(key)
            .map(|records| {
                records
                    .values()
                    .filter(|(_, stored)| now.duration_since(*stored) < PROVIDER_TTL)
                    .map(|(record, _)| record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Send a request and await the correlated response.
    async fn request(
        &self,
        to: SocketAddr,
        build: impl FnOnce(u64) -> DhtMessage,
    ) -> Result<DhtMessage> {
        let nonce = rand::random::<u64>();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(nonce, tx);

        let msg = build(nonce);
        let bytes = serde_json::to_vec(&msg).map_err(|e| DiscoveryError::Dht(e.to_string()))?;

        if let Err(e) = self.inner.socket.send_to(&bytes, to).await {
            self.inner.pending.remove(&nonce);
            return Err(DiscoveryError::Io(e));
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.inner.pending.remove(&nonce);
                Err(DiscoveryError::Timeout)
            }
        }
    }

    /// Ping a peer; a pong inserts it into the routing table.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Timeout`] when no pong arrives in time.
    pub async fn ping(&self, addr: SocketAddr) -> Result<PeerContact> {
        let local = self.inner.local;
        match self
            .request(addr, |nonce| DhtMessage::Ping {
                sender: local,
                nonce,
            })
            .await?
        {
            DhtMessage::Pong { sender, .. } => Ok(sender),
            other => Err(DiscoveryError::Malformed(format!(
                "expected pong, got {other:?}"
            ))),
        }
    }

    /// Join the network through bootstrap nodes.
    ///
    /// Pings every bootstrap address and then looks up the local id to
    /// populate the routing table. Unreachable bootstrap nodes are logged at
    /// debug level; the call succeeds if any responded.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NoPeers`] if no bootstrap node responded.
    pub async fn bootstrap(&self, bootstrap: &[SocketAddr]) -> Result<usize> {
        let mut responsive = 0;
        for addr in bootstrap {
            match self.ping(*addr).await {
                Ok(contact) => {
                    tracing::debug!(
                        "bootstrap node {} is {}",
                        addr,
                        contact.node_id.short()
                    );
                    responsive += 1;
                }
                Err(e) => tracing::debug!("bootstrap node {} unresponsive: {}", addr, e),
            }
        }

        if responsive == 0 {
            return Err(DiscoveryError::NoPeers);
        }

        let own_id = self.inner.id;
        self.find_node(&own_id).await;
        Ok(responsive)
    }

    /// Iterative FIND_NODE: the K closest peers to `target` reachable from
    /// the current routing table, querying α peers per round.
    pub async fn find_node(&self, target: &DhtId) -> Vec<DhtPeer> {
        let target = *target;
        let mut queried: HashSet<NodeId> = HashSet::new();
        queried.insert(self.inner.local.node_id);

        let mut closest = {
            let routing = self.inner.routing.lock().expect("routing lock");
            routing.closest(&target, K)
        };

        for _ in 0..MAX_ITERATIONS {
            let batch: Vec<DhtPeer> = closest
                .iter()
                .filter(|p| !queried.contains(&p.node_id))
                .take(ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for peer in batch {
                queried.insert(peer.node_id);
                let service = self.clone();
                let local = self.inner.local;
                handles.push(tokio::spawn(async move {
                    service
                        .request(peer.addr, |nonce| DhtMessage::FindNode {
                            sender: local,
                            nonce,
                            target,
                        })
                        .await
                }));
            }

            for handle in handles {
                let Ok(Ok(DhtMessage::Nodes { peers, .. })) = handle.await else {
                    continue;
                };
                for contact in peers {
                    if contact.node_id == self.inner.local.node_id {
                        continue;
                    }
                    if !closest.iter().any(|p| p.node_id == contact.node_id) {
                        closest.push(DhtPeer::new(contact.node_id, contact.addr));
                    }
                }
            }

            closest.sort_by_key(|p| p.id.distance(&target));
            closest.truncate(K);
        }

        closest
    }

    /// Announce a provider record under a key.
    ///
    /// The record is always stored locally; it is then pushed to the K
    /// closest peers found by iterative lookup. Returns the number of
    /// acknowledgements.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NoPeers`] while the routing table has
    /// nobody to push to (expected right after start, before bootstrap
    /// completes).
    pub async fn announce(&self, key: DhtId, record: ProviderRecord) -> Result<usize> {
        self.store_provider(key, record.clone());

        let targets = self.find_node(&key).await;
        if targets.is_empty() {
            return Err(DiscoveryError::NoPeers);
        }

        let mut handles = Vec::with_capacity(targets.len());
        for peer in targets {
            let service = self.clone();
            let local = self.inner.local;
            let record = record.clone();
            handles.push(tokio::spawn(async move {
                service
                    .request(peer.addr, |nonce| DhtMessage::Provide {
                        sender: local,
                        nonce,
                        key,
                        record,
                    })
                    .await
            }));
        }

        let mut acks = 0;
        for handle in handles {
            if let Ok(Ok(DhtMessage::ProvideAck { .. })) = handle.await {
                acks += 1;
            }
        }
        Ok(acks)
    }

    /// Query the providers of a key.
    ///
    /// Asks the K closest known peers; `closer` contacts from the responses
    /// widen the routing table so repeated queries converge.
    pub async fn providers(&self, key: DhtId) -> Vec<ProviderRecord> {
        let mut found: HashMap<NodeId, ProviderRecord> = self
            .local_providers(&key)
            .into_iter()
            .map(|r| (r.node_id, r))
            .collect();

        let targets = {
            let routing = self.inner.routing.lock().expect("routing lock");
            routing.closest(&key, K)
        };

        let mut handles = Vec::with_capacity(targets.len());
        for peer in targets {
            let service = self.clone();
            let local = self.inner.local;
            handles.push(tokio::spawn(async move {
                service
                    .request(peer.addr, |nonce| DhtMessage::GetProviders {
                        sender: local,
                        nonce,
                        key,
                    })
                    .await
            }));
        }

        for handle in handles {
            let Ok(Ok(DhtMessage::Providers {
                providers, closer, ..
            })) = handle.await
            else {
                continue;
            };

            for record in providers {
                found.insert(record.node_id, record);
            }

            let mut routing = self.inner.routing.lock().expect("routing lock");
            for contact in closer {
                if contact.node_id != self.inner.local.node_id {
                    routing.upsert(DhtPeer::new(contact.node_id, contact.addr));
                }
            }
        }

        found.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::{OsRng, RngCore};

    fn random_node_id() -> NodeId {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        NodeId::from_bytes(bytes)
    }

    fn loopback_config() -> DhtConfig {
        DhtConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            request_timeout: Duration::from_secs(2),
        }
    }

    async fn started_service(shutdown: &watch::Receiver<bool>) -> DhtService {
        let service = DhtService::bind(random_node_id(), loopback_config())
            .await
            .unwrap();
        service.start(shutdown.clone());
        service
    }

    #[tokio::test]
    async fn test_ping_populates_both_routing_tables() {
        let (_tx, shutdown) = watch::channel(false);
        let a = started_service(&shutdown).await;
        let b = started_service(&shutdown).await;

        let contact = b.ping(a.local_addr()).await.unwrap();
        assert_eq!(contact.node_id, a.inner.local.node_id);

        assert_eq!(b.peer_count(), 1);
        assert_eq!(a.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_ping_unreachable_times_out() {
        let (_tx, shutdown) = watch::channel(false);
        let a = started_service(&shutdown).await;

        // A bound but silent socket: nothing answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = a.ping(silent.local_addr().unwrap()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Timeout));
    }

    #[tokio::test]
    async fn test_bootstrap_requires_a_responder() {
        let (_tx, shutdown) = watch::channel(false);
        let a = started_service(&shutdown).await;

        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = a
            .bootstrap(&[silent.local_addr().unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoPeers));
    }

    #[tokio::test]
    async fn test_announce_and_query_through_hub() {
        let (_tx, shutdown) = watch::channel(false);
        let hub = started_service(&shutdown).await;
        let provider = started_service(&shutdown).await;
        let seeker = started_service(&shutdown).await;

        provider.bootstrap(&[hub.local_addr()]).await.unwrap();
        seeker.bootstrap(&[hub.local_addr()]).await.unwrap();

        let key = super::super::service_key("shario-p2p");
        let record = ProviderRecord {
            node_id: provider.inner.local.node_id,
            addrs: vec!["127.0.0.1:4040".parse().unwrap()],
        };

        let acks = provider.announce(key, record.clone()).await.unwrap();
        assert!(acks >= 1, "hub should acknowledge the record");

        let found = seeker.providers(key).await;
        assert!(
            found.iter().any(|r| r == &record),
            "seeker should learn the provider via the hub"
        );
    }

    #[tokio::test]
    async fn test_announce_with_empty_table_reports_no_peers() {
        let (_tx, shutdown) = watch::channel(false);
        let lonely = started_service(&shutdown).await;

        let key = super::super::service_key("shario-p2p");
        let record = ProviderRecord {
            node_id: lonely.inner.local.node_id,
            addrs: vec![],
        };

        assert!(matches!(
            lonely.announce(key, record).await,
            Err(DiscoveryError::NoPeers)
        ));
    }

    #[tokio::test]
    async fn test_local_provider_store() {
        let (_tx, shutdown) = watch::channel(false);
        let service = started_service(&shutdown).await;

        let key = DhtId::from_bytes([1u8; 32]);
        let record = ProviderRecord {
            node_id: random_node_id(),
            addrs: vec!["10.1.2.3:4040".parse().unwrap()],
        };

        service.store_provider(key, record.clone());
        assert_eq!(service.local_providers(&key), vec![record]);
        assert!(service.local_providers(&DhtId::from_bytes([2u8; 32])).is_empty());
    }
}
