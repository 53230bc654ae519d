//! Link-local multicast discovery.
//!
//! Every node in the same broadcast domain periodically multicasts a small
//! JSON beacon under the fixed service tag. Receivers combine the beacon's
//! advertised TCP ports with the packet's source address into dialable peer
//! addresses; their own beacons and foreign service tags are ignored.

use crate::error::{DiscoveryError, Result};
use crate::SERVICE_TAG;
use serde::{Deserialize, Serialize};
use shario_crypto::NodeId;
use shario_transport::PeerAddr;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Multicast configuration
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// IPv4 multicast group
    pub group: Ipv4Addr,
    /// UDP port the group listens on
    pub port: u16,
    /// Beacon interval
    pub interval: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 70, 77),
            port: 56700,
            interval: Duration::from_secs(5),
        }
    }
}

/// The beacon payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    /// Service tag; receivers ignore foreign tags
    pub service: String,
    /// Announcing node
    pub node_id: NodeId,
    /// TCP listen ports; combined with the packet source address
    pub tcp_ports: Vec<u16>,
}

/// Turn a received beacon into dialable addresses.
///
/// Filters the local node's own beacons and foreign service tags.
#[must_use]
pub fn beacon_to_peers(beacon: &Beacon, from: SocketAddr, local: NodeId) -> Vec<PeerAddr> {
    if beacon.service != SERVICE_TAG || beacon.node_id == local {
        return Vec::new();
    }

    beacon
        .tcp_ports
        .iter()
        .map(|port| PeerAddr::new(SocketAddr::new(from.ip(), *port), beacon.node_id))
        .collect()
}

/// Link-local multicast announcer and listener.
pub struct MulticastDiscovery {
    socket: Arc<UdpSocket>,
    config: MulticastConfig,
    node_id: NodeId,
    target: SocketAddr,
}

impl MulticastDiscovery {
    /// Bind the multicast socket and join the group.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Multicast`] if the socket cannot be set up
    /// (no multicast-capable interface, port in use without reuse support).
    pub fn bind(node_id: NodeId, config: MulticastConfig) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| DiscoveryError::Multicast(format!("socket: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| DiscoveryError::Multicast(format!("reuse_address: {e}")))?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        socket
            .bind(&bind_addr.into())
            .map_err(|e| DiscoveryError::Multicast(format!("bind {bind_addr}: {e}")))?;
        socket
            .join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| DiscoveryError::Multicast(format!("join group: {e}")))?;
        // Loopback so co-resident nodes on one host can find each other.
        socket
            .set_multicast_loop_v4(true)
            .map_err(|e| DiscoveryError::Multicast(format!("loop: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DiscoveryError::Multicast(format!("nonblocking: {e}")))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| DiscoveryError::Multicast(format!("tokio socket: {e}")))?;

        let target = SocketAddr::new(config.group.into(), config.port);

        Ok(Self {
            socket: Arc::new(socket),
            config,
            node_id,
            target,
        })
    }

    /// Start the announce and receive loops.
    ///
    /// `tcp_ports` are the transport listen ports to advertise; discovered
    /// peers land on `found`.
    pub fn start(
        &self,
        tcp_ports: Vec<u16>,
        found: mpsc::Sender<PeerAddr>,
        shutdown: watch::Receiver<bool>,
    ) {
        self.spawn_announce_loop(tcp_ports, shutdown.clone());
        self.spawn_recv_loop(found, shutdown);
    }

    fn spawn_announce_loop(&self, tcp_ports: Vec<u16>, mut shutdown: watch::Receiver<bool>) {
        let socket = Arc::clone(&self.socket);
        let target = self.target;
        let interval = self.config.interval;
        let beacon = Beacon {
            service: SERVICE_TAG.to_string(),
            node_id: self.node_id,
            tcp_ports,
        };

        tokio::spawn(async move {
            let bytes = match serde_json::to_vec(&beacon) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("beacon serialization failed: {}", e);
                    return;
                }
            };

            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(&bytes, target).await {
                            tracing::debug!("beacon send failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("multicast announce loop stopped");
        });
    }

    fn spawn_recv_loop(&self, found: mpsc::Sender<PeerAddr>, mut shutdown: watch::Receiver<bool>) {
        let socket = Arc::clone(&self.socket);
        let local = self.node_id;

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..len]) else {
                                tracing::debug!("malformed beacon from {}", from);
                                continue;
                            };
                            for peer in beacon_to_peers(&beacon, from, local) {
                                if found.send(peer).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!("multicast receive failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("multicast receive loop stopped");
        });
    }
}
