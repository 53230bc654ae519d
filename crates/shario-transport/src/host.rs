//! Transport host.
//!
//! Owns every authenticated session of the node: listeners, the dialer, and
//! one actor pair (reader + writer task) per TCP connection. Multiple
//! simultaneous connections to the same peer are kept (dual-stack dialing
//! and crossed dials both produce them); the session registry collapses them
//! into one logical peer.

use crate::addr::PeerAddr;
use crate::error::{Result, TransportError};
use crate::framing::{self, Frame};
use crate::session::{perform_handshake_initiator, perform_handshake_responder};
use crate::MAX_MESSAGE_SIZE;
use dashmap::DashMap;
use shario_crypto::noise::{NoiseKeypair, NoiseTransport};
use shario_crypto::signatures::SigningKey;
use shario_crypto::NodeId;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

/// Slack on top of [`MAX_MESSAGE_SIZE`] for the frame's protocol string and
/// encoding overhead.
const FRAME_OVERHEAD: usize = 4096;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// IPv4 listen port (0 = ephemeral)
    pub listen_port_v4: u16,
    /// IPv6 listen port (0 = ephemeral)
    pub listen_port_v6: u16,
    /// Whether to bind an IPv6 listener at all
    pub enable_ipv6: bool,
    /// Hard deadline for connect + handshake when dialing
    pub dial_timeout: Duration,
    /// Deadline for an inbound handshake to complete
    pub handshake_timeout: Duration,
    /// Deadline for continuation records once a message has begun
    pub message_read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_port_v4: 0,
            listen_port_v6: 0,
            enable_ipv6: true,
            dial_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            message_read_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection lifecycle and inbound substream notifications.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An authenticated connection to `peer` was established
    ConnectionOpened {
        /// Remote node id
        peer: NodeId,
        /// Remote socket address of this connection
        addr: SocketAddr,
    },
    /// One underlying connection to `peer` went away
    ConnectionClosed {
        /// Remote node id
        peer: NodeId,
        /// Remote socket address of the closed connection
        addr: SocketAddr,
    },
    /// A complete substream message arrived
    Message {
        /// Remote node id
        peer: NodeId,
        /// Protocol the substream was opened for
        protocol: String,
        /// The framed payload
        payload: Vec<u8>,
    },
}

struct Outbound {
    frame: Frame,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Clone)]
struct ConnectionHandle {
    conn_id: u64,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
}

struct HostInner {
    local_id: NodeId,
    signing: Arc<SigningKey>,
    noise: NoiseKeypair,
    config: TransportConfig,
    connections: DashMap<NodeId, Vec<ConnectionHandle>>,
    listen_addrs: RwLock<Vec<SocketAddr>>,
    listening: AtomicBool,
    events: mpsc::Sender<TransportEvent>,
    shutdown: watch::Receiver<bool>,
    next_conn_id: AtomicU64,
}

/// The transport host. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct TransportHost {
    inner: Arc<HostInner>,
}

impl TransportHost {
    /// Create a transport host for the given identity.
    ///
    /// `events` receives connection lifecycle and message notifications;
    /// `shutdown` is the root shutdown watch (listeners and connections close
    /// when it flips to `true`).
    #[must_use]
    pub fn new(
        signing: Arc<SigningKey>,
        config: TransportConfig,
        events: mpsc::Sender<TransportEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let noise = NoiseKeypair::derive_from_seed(&signing.noise_seed());
        let local_id = signing.node_id();

        Self {
            inner: Arc::new(HostInner {
                local_id,
                signing,
                noise,
                config,
                connections: DashMap::new(),
                listen_addrs: RwLock::new(Vec::new()),
                listening: AtomicBool::new(false),
                events,
                shutdown,
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// The local node identifier.
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    /// Start listening. Idempotent: later calls just return the addresses.
    ///
    /// Binds IPv4 always and IPv6 when enabled; an unavailable IPv6 stack is
    /// logged and skipped rather than failing the node.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Listen`] if the IPv4 listener cannot bind.
    pub async fn listen(&self) -> Result<Vec<PeerAddr>> {
        if !self.inner.listening.swap(true, Ordering::SeqCst) {
            let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.inner.config.listen_port_v4));
            let listener = TcpListener::bind(v4)
                .await
                .map_err(|e| TransportError::Listen(format!("bind {v4}: {e}")))?;
            let local = listener.local_addr()?;
            self.inner.listen_addrs.write().expect("addr lock").push(local);
            tracing::info!("listening on {}", local);
            self.spawn_accept_loop(listener);

            if self.inner.config.enable_ipv6 {
                let v6 =
                    SocketAddr::from((Ipv6Addr::UNSPECIFIED, self.inner.config.listen_port_v6));
                match TcpListener::bind(v6).await {
                    Ok(listener) => {
                        let local = listener.local_addr()?;
                        self.inner.listen_addrs.write().expect("addr lock").push(local);
                        tracing::info!("listening on {}", local);
                        self.spawn_accept_loop(listener);
                    }
                    Err(e) => tracing::debug!("IPv6 listener unavailable: {}", e),
                }
            }
        }

        Ok(self.listen_addrs())
    }

    /// Current listen addresses with the local identifier suffix.
    #[must_use]
    pub fn listen_addrs(&self) -> Vec<PeerAddr> {
        self.inner
            .listen_addrs
            .read()
            .expect("addr lock")
            .iter()
            .map(|a| PeerAddr::new(*a, self.inner.local_id))
            .collect()
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let host = self.clone();
        let mut shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let host = host.clone();
                            tokio::spawn(async move {
                                if let Err(e) = host.handle_inbound(stream, addr).await {
                                    tracing::debug!("inbound handshake from {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    async fn handle_inbound(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        stream.set_nodelay(true).ok();

        let (transport, remote_id) = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            perform_handshake_responder(&mut stream, &self.inner.noise, &self.inner.signing),
        )
        .await
        .map_err(|_| TransportError::timeout("inbound handshake"))??;

        self.register_connection(stream, transport, remote_id, addr)
            .await
    }

    /// Dial a peer at an address carrying its expected identifier.
    ///
    /// Already-connected peers are not re-dialed. Completes once the session
    /// is authenticated; the registry hears about it via
    /// [`TransportEvent::ConnectionOpened`].
    ///
    /// # Errors
    ///
    /// - [`TransportError::Unreachable`] when the TCP connect fails
    /// - [`TransportError::AuthFailed`] when the remote proves a different id
    /// - [`TransportError::Timeout`] when the deadline elapses
    pub async fn dial(&self, target: &PeerAddr) -> Result<()> {
        if target.node_id == self.inner.local_id {
            return Err(TransportError::protocol("refusing to dial self"));
        }
        if self.is_connected(target.node_id) {
            return Ok(());
        }

        let result = tokio::time::timeout(self.inner.config.dial_timeout, async {
            let mut stream = TcpStream::connect(target.addr)
                .await
                .map_err(|e| TransportError::Unreachable(format!("{}: {e}", target.addr)))?;
            stream.set_nodelay(true).ok();

            let (transport, remote_id) =
                perform_handshake_initiator(&mut stream, &self.inner.noise, &self.inner.signing)
                    .await?;

            if remote_id != target.node_id {
                return Err(TransportError::AuthFailed {
                    expected: target.node_id,
                    actual: remote_id,
                });
            }

            Ok((stream, transport, remote_id))
        })
        .await
        .map_err(|_| TransportError::timeout("dial"))?;

        let (stream, transport, remote_id) = result?;
        self.register_connection(stream, transport, remote_id, target.addr)
            .await
    }

    async fn register_connection(
        &self,
        stream: TcpStream,
        transport: NoiseTransport,
        peer: NodeId,
        addr: SocketAddr,
    ) -> Result<()> {
        if peer == self.inner.local_id {
            tracing::debug!("dropping connection to self via {}", addr);
            return Ok(());
        }

        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let noise = Arc::new(Mutex::new(transport));
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);

        let handle = ConnectionHandle {
            conn_id,
            remote_addr: addr,
            outbound: outbound_tx,
        };
        self.inner.connections.entry(peer).or_default().push(handle);

        tracing::debug!(
            "connection {} established with peer {} via {}",
            conn_id,
            peer.short(),
            addr
        );

        // Emit before the actor tasks exist so a connection that dies
        // immediately still orders Opened before Closed.
        let _ = self
            .inner
            .events
            .send(TransportEvent::ConnectionOpened { peer, addr })
            .await;

        let (mut rd, mut wr) = stream.into_split();

        let writer_noise = Arc::clone(&noise);
        let mut writer_task = tokio::spawn(async move {
            while let Some(out) = outbound_rx.recv().await {
                let result = framing::write_message(&mut wr, &writer_noise, &out.frame).await;
                let failed = result.is_err();
                let _ = out.done.send(result);
                if failed {
                    break;
                }
            }
        });

        let reader_noise = Arc::clone(&noise);
        let events = self.inner.events.clone();
        let read_timeout = self.inner.config.message_read_timeout;
        let mut reader_task = tokio::spawn(async move {
            loop {
                match framing::read_message(
                    &mut rd,
                    &reader_noise,
                    MAX_MESSAGE_SIZE + FRAME_OVERHEAD,
                    read_timeout,
                )
                .await
                {
                    Ok(frame) => {
                        let event = TransportEvent::Message {
                            peer,
                            protocol: frame.protocol,
                            payload: frame.payload,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            "connection to {} closing: {}",
                            peer.short(),
                            e
                        );
                        break;
                    }
                }
            }
        });

        // Supervisor: whichever half finishes first tears the connection down.
        let host = self.clone();
        let mut shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut reader_task => {}
                _ = &mut writer_task => {}
                _ = shutdown.changed() => {}
            }
            reader_task.abort();
            writer_task.abort();
            host.remove_connection(peer, conn_id, addr).await;
        });

        Ok(())
    }

    async fn remove_connection(&self, peer: NodeId, conn_id: u64, addr: SocketAddr) {
        let mut emptied = false;
        if let Some(mut entry) = self.inner.connections.get_mut(&peer) {
            entry.retain(|h| h.conn_id != conn_id);
            emptied = entry.is_empty();
        }
        if emptied {
            self.inner.connections.remove_if(&peer, |_, v| v.is_empty());
        }

        tracing::debug!("connection {} to {} closed", conn_id, peer.short());
        let _ = self
            .inner
            .events
            .send(TransportEvent::ConnectionClosed { peer, addr })
            .await;
    }

    /// Whether at least one live connection to `peer` remains.
    #[must_use]
    pub fn is_connected(&self, peer: NodeId) -> bool {
        self.inner
            .connections
            .get(&peer)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Number of live connections to `peer`.
    #[must_use]
    pub fn connection_count(&self, peer: NodeId) -> usize {
        self.inner.connections.get(&peer).map(|v| v.len()).unwrap_or(0)
    }

    /// Peers with at least one live connection.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.inner
            .connections
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| *e.key())
            .collect()
    }

    /// Remote addresses of the live connections to `peer`.
    #[must_use]
    pub fn remote_addrs(&self, peer: NodeId) -> Vec<SocketAddr> {
        self.inner
            .connections
            .get(&peer)
            .map(|v| v.iter().map(|h| h.remote_addr).collect())
            .unwrap_or_default()
    }

    /// Open a substream to `peer` for `protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] without a live session.
    pub fn open_stream(&self, peer: NodeId, protocol: &str) -> Result<Substream> {
        let outbound = self
            .inner
            .connections
            .get(&peer)
            .and_then(|v| v.first().map(|h| h.outbound.clone()))
            .ok_or(TransportError::NotConnected(peer))?;

        Ok(Substream {
            protocol: protocol.to_string(),
            outbound,
        })
    }

    /// Open a substream and send one framed payload on it.
    ///
    /// # Errors
    ///
    /// Propagates [`Substream::send`] and [`Self::open_stream`] failures.
    pub async fn send(&self, peer: NodeId, protocol: &str, payload: Vec<u8>) -> Result<()> {
        self.open_stream(peer, protocol)?.send(payload).await
    }
}

/// A one-message substream.
///
/// Substreams are short-lived: write the single framed payload and the
/// stream is done. `send` resolves only after the message has been fully
/// written to the underlying socket, which is what lets a caller serialize
/// its own emission order.
pub struct Substream {
    protocol: String,
    outbound: mpsc::Sender<Outbound>,
}

impl Substream {
    /// Send the substream's single message and close it.
    ///
    /// # Errors
    ///
    /// - [`TransportError::MessageTooLarge`] above the payload ceiling
    /// - [`TransportError::ConnectionClosed`] if the session died first
    pub async fn send(self, payload: Vec<u8>) -> Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }

        let (done_tx, done_rx) = oneshot::channel();
        let out = Outbound {
            frame: Frame {
                protocol: self.protocol,
                payload,
            },
            done: done_tx,
        };

        self.outbound
            .send(out)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        done_rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }
}
