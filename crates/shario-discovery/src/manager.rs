//! Discovery manager.
//!
//! Orchestrates the multicast beacon and the DHT under the root shutdown
//! watch: a bootstrap pass, a periodic announce loop, a periodic provider
//! query loop and a health check. Discovered peers are deduplicated into a
//! seen-set for health accounting and forwarded to the node for dialing.

use crate::dht::{service_key, DhtConfig, DhtService, ProviderRecord};
use crate::error::Result;
use crate::multicast::{MulticastConfig, MulticastDiscovery};
use crate::SERVICE_TAG;
use shario_crypto::NodeId;
use shario_transport::PeerAddr;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How many consecutive empty health checks before warning.
const HEALTH_EMPTY_CHECKS: u32 = 4;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Run the link-local multicast beacon
    pub enable_multicast: bool,
    /// Multicast parameters
    pub multicast: MulticastConfig,
    /// Run the DHT
    pub enable_dht: bool,
    /// DHT parameters
    pub dht: DhtConfig,
    /// DHT bootstrap nodes
    pub bootstrap: Vec<SocketAddr>,
    /// How often to announce the service record
    pub announce_interval: Duration,
    /// How often to query for providers
    pub query_interval: Duration,
    /// How often the health check runs
    pub health_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enable_multicast: true,
            multicast: MulticastConfig::default(),
            enable_dht: true,
            dht: DhtConfig::default(),
            bootstrap: Vec::new(),
            announce_interval: Duration::from_secs(5),
            query_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(15),
        }
    }
}

struct ManagerInner {
    node_id: NodeId,
    config: DiscoveryConfig,
    dht: Option<DhtService>,
    multicast: Option<MulticastDiscovery>,
    found: mpsc::Sender<PeerAddr>,
    discovered: Mutex<HashSet<NodeId>>,
    shutdown: watch::Receiver<bool>,
}

/// Discovery manager. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DiscoveryManager {
    inner: Arc<ManagerInner>,
}

impl DiscoveryManager {
    /// Set up discovery endpoints.
    ///
    /// An unavailable mechanism (multicast on a host without a capable
    /// interface, an unbindable DHT port) is logged and skipped rather than
    /// failing the node; discovery failures are transient by policy.
    ///
    /// # Errors
    ///
    /// Currently infallible in practice; the signature leaves room for
    /// configurations that must fail loudly.
    pub async fn new(
        node_id: NodeId,
        config: DiscoveryConfig,
        found: mpsc::Sender<PeerAddr>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let dht = if config.enable_dht {
            match DhtService::bind(node_id, config.dht.clone()).await {
                Ok(service) => Some(service),
                Err(e) => {
                    tracing::warn!("DHT unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let multicast = if config.enable_multicast {
            match MulticastDiscovery::bind(node_id, config.multicast.clone()) {
                Ok(discovery) => Some(discovery),
                Err(e) => {
                    tracing::warn!("multicast discovery unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(ManagerInner {
                node_id,
                config,
                dht,
                multicast,
                found,
                discovered: Mutex::new(HashSet::new()),
                shutdown,
            }),
        })
    }

    /// Number of distinct peers discovered so far.
    #[must_use]
    pub fn discovered_count(&self) -> usize {
        self.inner.discovered.lock().expect("discovered lock").len()
    }

    /// Start all discovery loops.
    ///
    /// `advertised_tcp` is the set of transport addresses other nodes should
    /// dial; it goes into the DHT provider record and (as ports) into the
    /// multicast beacon.
    pub fn start(&self, advertised_tcp: Vec<SocketAddr>) {
        let (raw_tx, raw_rx) = mpsc::channel::<PeerAddr>(256);

        self.spawn_forwarder(raw_rx);

        if let Some(multicast) = &self.inner.multicast {
            let ports = advertised_tcp.iter().map(SocketAddr::port).collect();
            multicast.start(ports, raw_tx.clone(), self.inner.shutdown.clone());
        }

        if let Some(dht) = &self.inner.dht {
            dht.start(self.inner.shutdown.clone());
            self.spawn_dht_loops(dht.clone(), advertised_tcp, raw_tx);
        }

        self.spawn_health_loop();
    }

    /// Deduplicate found peers into the seen-set and hand them to the node.
    fn spawn_forwarder(&self, mut raw_rx: mpsc::Receiver<PeerAddr>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(peer) = raw_rx.recv().await {
                manager
                    .inner
                    .discovered
                    .lock()
                    .expect("discovered lock")
                    .insert(peer.node_id);
                if manager.inner.found.send(peer).await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_dht_loops(
        &self,
        dht: DhtService,
        advertised_tcp: Vec<SocketAddr>,
        raw_tx: mpsc::Sender<PeerAddr>,
    ) {
        let key = service_key(SERVICE_TAG);
        let node_id = self.inner.node_id;
        let bootstrap = self.inner.config.bootstrap.clone();

        // One-shot bootstrap pass.
        {
            let dht = dht.clone();
            tokio::spawn(async move {
                if bootstrap.is_empty() {
                    return;
                }
                match dht.bootstrap(&bootstrap).await {
                    Ok(count) => tracing::info!("DHT bootstrapped via {} node(s)", count),
                    Err(e) => tracing::debug!("DHT bootstrap incomplete: {}", e),
                }
            });
        }

        // Announce loop.
        {
            let dht = dht.clone();
            let mut shutdown = self.inner.shutdown.clone();
            let interval = self.inner.config.announce_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let record = ProviderRecord {
                                node_id,
                                addrs: advertised_tcp.clone(),
                            };
                            if let Err(e) = dht.announce(key, record).await {
                                // Expected until the routing table fills.
                                if dht.routing_is_empty() {
                                    tracing::debug!("DHT announce deferred: {}", e);
                                } else {
                                    tracing::warn!("DHT announce failed: {}", e);
                                }
                            }
                        }
                    }
                }
            });
        }

        // Provider query loop.
        {
            let mut shutdown = self.inner.shutdown.clone();
            let interval = self.inner.config.query_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            for record in dht.providers(key).await {
                                if record.node_id == node_id {
                                    continue;
                                }
                                for addr in record.addrs {
                                    let peer = PeerAddr::new(addr, record.node_id);
                                    if raw_tx.send(peer).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            });
        }
    }

    fn spawn_health_loop(&self) {
        let manager = self.clone();
        let mut shutdown = self.inner.shutdown.clone();
        let interval = self.inner.config.health_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut empty_checks = 0u32;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let count = manager.discovered_count();
                        tracing::debug!("discovery health: {} peer(s) discovered", count);
                        if count == 0 {
                            empty_checks += 1;
                            if empty_checks >= HEALTH_EMPTY_CHECKS {
                                tracing::warn!(
                                    "no peers discovered after {} checks; network may be isolated",
                                    empty_checks
                                );
                                empty_checks = 0;
                            }
                        } else {
                            empty_checks = 0;
                        }
                    }
                }
            }
        });
    }
}

/// Rewrite unspecified listen addresses into something other hosts can dial.
///
/// An `0.0.0.0`/`::` listener is reachable on every interface; advertise the
/// address of the default route interface (probed without sending traffic),
/// falling back to loopback.
#[must_use]
pub fn advertise_addrs(listen: &[PeerAddr]) -> Vec<SocketAddr> {
    let source_ip = local_source_ip();
    listen
        .iter()
        .map(|peer| {
            if peer.addr.ip().is_unspecified() {
                SocketAddr::new(source_ip, peer.addr.port())
            } else {
                peer.addr
            }
        })
        .collect()
}

/// The local IP the default route would use, learned from a connected UDP
/// socket without sending a packet.
fn local_source_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::LOCALHOST))
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

    fn loopback_dht_config(query_ms: u64) -> DiscoveryConfig {
        DiscoveryConfig {
            enable_multicast: false,
            enable_dht: true,
            dht: DhtConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                request_timeout: Duration::from_secs(2),
            },
            announce_interval: Duration::from_millis(query_ms),
            query_interval: Duration::from_millis(query_ms),
            health_interval: Duration::from_secs(15),
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_advertise_addrs_rewrites_unspecified() {
        let id = random_node_id();
        let listen = vec![
            PeerAddr::new("0.0.0.0:4040".parse().unwrap(), id),
            PeerAddr::new("192.168.1.9:4041".parse().unwrap(), id),
        ];

        let advertised = advertise_addrs(&listen);
        assert_eq!(advertised.len(), 2);
        assert!(!advertised[0].ip().is_unspecified());
        assert_eq!(advertised[0].port(), 4040);
        assert_eq!(advertised[1], "192.168.1.9:4041".parse().unwrap());
    }

    #[tokio::test]
    async fn test_disabled_discovery_starts_quietly() {
        let (_tx, shutdown) = watch::channel(false);
        let (found_tx, mut found_rx) = mpsc::channel(16);

        let config = DiscoveryConfig {
            enable_multicast: false,
            enable_dht: false,
            ..DiscoveryConfig::default()
        };
        let manager = DiscoveryManager::new(random_node_id(), config, found_tx, shutdown)
            .await
            .unwrap();
        manager.start(vec![]);

        assert_eq!(manager.discovered_count(), 0);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), found_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_two_nodes_discover_each_other_via_dht() {
        use crate::dht::DhtService;

        let (_tx, shutdown) = watch::channel(false);

        // A bare DHT endpoint acts as the shared bootstrap node.
        let hub = DhtService::bind(
            random_node_id(),
            DhtConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                request_timeout: Duration::from_secs(2),
            },
        )
        .await
        .unwrap();
        hub.start(shutdown.clone());

        let (a_tx, _a_rx) = mpsc::channel(64);
        let (b_tx, mut b_rx) = mpsc::channel(64);

        let mut a_config = loopback_dht_config(200);
        a_config.bootstrap = vec![hub.local_addr()];
        let mut b_config = loopback_dht_config(200);
        b_config.bootstrap = vec![hub.local_addr()];

        let a_id = random_node_id();
        let a = DiscoveryManager::new(a_id, a_config, a_tx, shutdown.clone())
            .await
            .unwrap();
        let b = DiscoveryManager::new(random_node_id(), b_config, b_tx, shutdown.clone())
            .await
            .unwrap();

        let a_tcp: SocketAddr = "127.0.0.1:14040".parse().unwrap();
        a.start(vec![a_tcp]);
        b.start(vec!["127.0.0.1:14041".parse().unwrap()]);

        // B should eventually surface A's provider record.
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let peer = b_rx.recv().await.expect("channel open");
                if peer.node_id == a_id {
                    return peer;
                }
            }
        })
        .await
        .expect("discovery timed out");

        assert_eq!(found.addr, a_tcp);
        assert!(b.discovered_count() >= 1);
    }
}
