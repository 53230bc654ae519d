//! File transfers.
//!
//! Implements the offer/accept/data/complete/cancel protocol over
//! `/shario/transfer/1.0.0`. Files travel in fixed 1 KiB chunks, one chunk
//! per substream, emitted serially so per-connection ordering carries over
//! to chunk ordering. The receiver verifies the whole-file SHA-256 digest
//! from the offer after the last chunk; `completed` therefore implies the
//! digest matched.
//!
//! Every transfer owns its file handle exclusively; the handle is released
//! on every terminal transition. Terminal states are never revised. A
//! failure in one transfer never touches another.

use crate::error::{NodeError, Result};
use crate::protocol::{self, unix_now, TransferPayload};
use crate::registry::{RegistryEvent, SessionRegistry};
use crate::{CHUNK_SIZE, PROTOCOL_TRANSFER};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use shario_crypto::hash::sha256_file_hex;
use shario_crypto::NodeId;
use shario_transport::{TransportError, TransportHost};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, watch, Mutex, RwLock};

/// Transfer identifier (32 random bytes, hex on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId([u8; 32]);

impl TransferId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    /// Create from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Abbreviated form for logs.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self.short())
    }
}

impl FromStr for TransferId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| "expected 32 bytes".to_string())?;
        Ok(Self(arr))
    }
}

impl Serialize for TransferId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for TransferId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Offered but not yet accepted
    Pending,
    /// Chunks are flowing
    Active,
    /// All bytes delivered and the digest verified
    Completed,
    /// I/O, decode or integrity failure
    Failed,
    /// Rejected, cancelled or the peer vanished
    Cancelled,
}

impl TransferStatus {
    /// Whether this status is terminal (never revised).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local node is sending
    Send,
    /// Local node is receiving
    Receive,
}

/// Snapshot of a transfer's state.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Transfer identifier
    pub id: TransferId,
    /// Basename of the file
    pub filename: String,
    /// Declared size in bytes
    pub size: u64,
    /// Bytes transferred so far (monotone non-decreasing)
    pub bytes_transferred: u64,
    /// Current status
    pub status: TransferStatus,
    /// Direction from the local node's point of view
    pub direction: Direction,
    /// Remote peer
    pub peer: NodeId,
    /// Local file path (source when sending, destination when receiving)
    pub path: PathBuf,
    /// SHA-256 hex digest of the file contents, from the offer
    pub checksum: String,
    /// Unix seconds the transfer was created
    pub started_at: u64,
    /// Unix seconds of the terminal transition
    pub completed_at: Option<u64>,
    /// Error description for failed transfers
    pub error: Option<String>,
}

impl Transfer {
    /// Progress percentage, clamped to `[0, 100]`.
    ///
    /// Reaches 100 exactly when the transfer completed; a transfer that
    /// moved every byte but has not verified yet reports 99.
    #[must_use]
    pub fn progress(&self) -> u8 {
        match self.status {
            TransferStatus::Completed => 100,
            _ if self.size == 0 => 0,
            _ => {
                let pct = self.bytes_transferred.saturating_mul(100) / self.size;
                pct.min(99) as u8
            }
        }
    }
}

/// Decides whether an inbound offer is accepted.
///
/// The transfer's state machine blocks on this call; implementations should
/// answer promptly (a stalled handler stalls that transfer only).
pub type OfferHandler = Arc<dyn Fn(&Transfer) -> bool + Send + Sync>;

struct TransferContext {
    state: RwLock<Transfer>,
    /// The receiver's open destination file. Exclusively owned; taken and
    /// dropped on every terminal transition.
    file: Mutex<Option<tokio::fs::File>>,
}

struct ManagerInner {
    transport: TransportHost,
    transfers: DashMap<TransferId, Arc<TransferContext>>,
    updates: broadcast::Sender<Transfer>,
    offer_handler: StdRwLock<Option<OfferHandler>>,
    downloads_dir: PathBuf,
}

/// The transfer manager. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    /// Create the transfer manager.
    ///
    /// Chunking always uses the fixed [`CHUNK_SIZE`]; both sides of a
    /// transfer must agree on it for the receiver's chunk-index bookkeeping
    /// to hold, so it is a protocol constant rather than configuration.
    #[must_use]
    pub fn new(transport: TransportHost, downloads_dir: PathBuf) -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                transfers: DashMap::new(),
                updates,
                offer_handler: StdRwLock::new(None),
                downloads_dir,
            }),
        }
    }

    /// Register the offer decision handler.
    ///
    /// Without a handler every inbound offer is rejected.
    pub fn set_offer_handler(&self, handler: OfferHandler) {
        *self.inner.offer_handler.write().expect("handler lock") = Some(handler);
    }

    /// Subscribe to transfer snapshots; one arrives after every state or
    /// progress change.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Transfer> {
        self.inner.updates.subscribe()
    }

    /// Start reacting to registry events. Runs until shutdown.
    pub fn start(&self, registry: &SessionRegistry, mut shutdown: watch::Receiver<bool>) {
        let manager = self.clone();
        let mut events = registry.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(RegistryEvent::Message { peer, protocol, payload }) => {
                            if protocol != PROTOCOL_TRANSFER {
                                continue;
                            }
                            match protocol::decode_transfer(&payload) {
                                Ok(decoded) => manager.handle_payload(peer, decoded).await,
                                Err(e) => {
                                    tracing::debug!(
                                        "dropping malformed transfer message from {}: {}",
                                        peer.short(),
                                        e
                                    );
                                }
                            }
                        }
                        Some(RegistryEvent::PeerDisconnected(peer)) => {
                            manager.cancel_all_for_peer(peer).await;
                        }
                        Some(RegistryEvent::PeerConnected(_)) => {}
                        None => break,
                    }
                }
            }
            tracing::debug!("transfer manager stopped");
        });
    }

    // ============ Outbound (sender) ============

    /// Offer a file to a connected peer.
    ///
    /// Streams the file through SHA-256, records the transfer as pending and
    /// sends the offer. Chunks start flowing when the peer accepts.
    ///
    /// # Errors
    ///
    /// - [`NodeError::Transfer`] for an empty or non-regular file
    /// - [`NodeError::Transport`] when the peer is not connected or the
    ///   offer cannot be sent
    pub async fn send_file(&self, peer: NodeId, path: impl AsRef<Path>) -> Result<TransferId> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(NodeError::transfer("not a regular file"));
        }
        let size = metadata.len();
        if size == 0 {
            return Err(NodeError::transfer("cannot send an empty file"));
        }
        if !self.inner.transport.is_connected(peer) {
            return Err(TransportError::NotConnected(peer).into());
        }

        let digest_path = path.clone();
        let checksum = tokio::task::spawn_blocking(move || sha256_file_hex(&digest_path))
            .await
            .map_err(|e| NodeError::Transfer(e.to_string().into()))??;

        let id = TransferId::random();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let transfer = Transfer {
            id,
            filename: filename.clone(),
            size,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            direction: Direction::Send,
            peer,
            path,
            checksum: checksum.clone(),
            started_at: unix_now(),
            completed_at: None,
            error: None,
        };

        let context = Arc::new(TransferContext {
            state: RwLock::new(transfer),
            file: Mutex::new(None),
        });
        self.inner.transfers.insert(id, Arc::clone(&context));
        self.notify(&context).await;

        tracing::info!(
            "offering {} ({} bytes) to {} as transfer {}",
            filename,
            size,
            peer.short(),
            id.short()
        );

        let offer = TransferPayload::Offer {
            transfer_id: id,
            filename,
            size,
            checksum,
        };
        if let Err(e) = self.send_payload(peer, &offer).await {
            self.fail(&context, format!("offer could not be sent: {e}")).await;
            return Err(e);
        }

        Ok(id)
    }

    /// Cancel a transfer from the local side.
    ///
    /// Terminal transfers are left untouched. The wire `cancel` is
    /// best-effort: a transmission failure is logged and local state stands.
    pub async fn cancel(&self, id: TransferId) -> Result<()> {
        let context = self
            .inner
            .transfers
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(NodeError::TransferNotFound(id))?;

        let peer = {
            let mut state = context.state.write().await;
            if state.status.is_terminal() {
                return Ok(());
            }
            state.status = TransferStatus::Cancelled;
            state.completed_at = Some(unix_now());
            state.peer
        };
        self.release_file(&context).await;
        self.notify(&context).await;
        tracing::info!("transfer {} cancelled locally", id.short());

        if let Err(e) = self
            .send_payload(peer, &TransferPayload::Cancel { transfer_id: id })
            .await
        {
            tracing::debug!("cancel for {} not transmitted: {}", id.short(), e);
        }
        Ok(())
    }

    /// Cancel every non-terminal transfer with a vanished peer.
    async fn cancel_all_for_peer(&self, peer: NodeId) {
        let contexts: Vec<Arc<TransferContext>> = self
            .inner
            .transfers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        for context in contexts {
            let cancelled = {
                let mut state = context.state.write().await;
                if state.peer == peer && !state.status.is_terminal() {
                    state.status = TransferStatus::Cancelled;
                    state.completed_at = Some(unix_now());
                    true
                } else {
                    false
                }
            };
            if cancelled {
                self.release_file(&context).await;
                self.notify(&context).await;
                let id = context.state.read().await.id;
                tracing::info!(
                    "transfer {} cancelled, peer {} disconnected",
                    id.short(),
                    peer.short()
                );
            }
        }
    }

    // ============ Protocol dispatch ============

    async fn handle_payload(&self, peer: NodeId, payload: TransferPayload) {
        match payload {
            TransferPayload::Offer {
                transfer_id,
                filename,
                size,
                checksum,
            } => {
                self.handle_offer(peer, transfer_id, filename, size, checksum)
                    .await;
            }
            TransferPayload::Accept { transfer_id } => self.handle_accept(peer, transfer_id).await,
            TransferPayload::Reject { transfer_id } => self.handle_reject(peer, transfer_id).await,
            TransferPayload::Data {
                transfer_id,
                chunk_index,
                data,
                is_last,
            } => {
                self.handle_data(peer, transfer_id, chunk_index, &data, is_last)
                    .await;
            }
            TransferPayload::Complete { transfer_id } => {
                self.handle_complete(peer, transfer_id).await;
            }
            TransferPayload::Cancel { transfer_id } => self.handle_cancel(peer, transfer_id).await,
        }
    }

    async fn handle_offer(
        &self,
        peer: NodeId,
        id: TransferId,
        filename: String,
        size: u64,
        checksum: String,
    ) {
        if self.inner.transfers.contains_key(&id) {
            tracing::debug!("duplicate offer {} ignored", id.short());
            return;
        }

        let basename = Path::new(&filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let destination = dedup_path(&self.inner.downloads_dir, &basename);

        let transfer = Transfer {
            id,
            filename: basename.clone(),
            size,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            direction: Direction::Receive,
            peer,
            path: destination.clone(),
            checksum,
            started_at: unix_now(),
            completed_at: None,
            error: None,
        };

        let context = Arc::new(TransferContext {
            state: RwLock::new(transfer.clone()),
            file: Mutex::new(None),
        });
        self.inner.transfers.insert(id, Arc::clone(&context));
        self.notify(&context).await;

        let handler = self.inner.offer_handler.read().expect("handler lock").clone();
        let accepted = match handler {
            Some(handler) => handler(&transfer),
            None => {
                tracing::debug!("no offer handler registered, rejecting {}", id.short());
                false
            }
        };

        if !accepted {
            {
                let mut state = context.state.write().await;
                state.status = TransferStatus::Cancelled;
                state.completed_at = Some(unix_now());
            }
            self.notify(&context).await;
            tracing::info!("offer {} ({}) rejected", id.short(), basename);
            if let Err(e) = self
                .send_payload(peer, &TransferPayload::Reject { transfer_id: id })
                .await
            {
                tracing::debug!("reject for {} not transmitted: {}", id.short(), e);
            }
            return;
        }

        // Open the destination before accepting so an unwritable downloads
        // directory fails the transfer instead of the chunk stream.
        let open_result: std::io::Result<tokio::fs::File> = async {
            tokio::fs::create_dir_all(&self.inner.downloads_dir).await?;
            tokio::fs::File::create(&destination).await
        }
        .await;

        match open_result {
            Ok(file) => {
                *context.file.lock().await = Some(file);
                {
                    let mut state = context.state.write().await;
                    state.status = TransferStatus::Active;
                }
                self.notify(&context).await;
                tracing::info!(
                    "accepted transfer {} ({} bytes) into {}",
                    id.short(),
                    size,
                    destination.display()
                );
                if let Err(e) = self
                    .send_payload(peer, &TransferPayload::Accept { transfer_id: id })
                    .await
                {
                    self.fail(&context, format!("accept could not be sent: {e}")).await;
                }
            }
            Err(e) => {
                self.fail(&context, format!("cannot open destination: {e}")).await;
                if let Err(e) = self
                    .send_payload(peer, &TransferPayload::Cancel { transfer_id: id })
                    .await
                {
                    tracing::debug!("cancel for {} not transmitted: {}", id.short(), e);
                }
            }
        }
    }

    async fn handle_accept(&self, peer: NodeId, id: TransferId) {
        let Some(context) = self.context_for(peer, id, Direction::Send).await else {
            return;
        };

        {
            let mut state = context.state.write().await;
            if state.status != TransferStatus::Pending {
                return;
            }
            state.status = TransferStatus::Active;
        }
        self.notify(&context).await;
        tracing::info!("transfer {} accepted, streaming chunks", id.short());

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.stream_chunks(&context, peer, id).await {
                // A cancellation that raced the stream keeps its status.
                if context.state.read().await.status.is_terminal() {
                    return;
                }
                match &e {
                    // The connection died under the stream: the peer is
                    // gone, which cancels rather than fails the transfer.
                    NodeError::Transport(
                        TransportError::ConnectionClosed | TransportError::NotConnected(_),
                    ) => manager.cancel_local(&context).await,
                    _ => manager.fail(&context, e.to_string()).await,
                }
            }
        });
    }

    /// Send every chunk serially; one chunk per substream, next chunk only
    /// after the previous one was fully written to the transport.
    async fn stream_chunks(
        &self,
        context: &Arc<TransferContext>,
        peer: NodeId,
        id: TransferId,
    ) -> Result<()> {
        let (path, size) = {
            let state = context.state.read().await;
            (state.path.clone(), state.size)
        };
        let chunk_size = CHUNK_SIZE as u64;
        let total_chunks = size.div_ceil(chunk_size);

        let file = tokio::fs::File::open(&path).await?;
        let mut reader = BufReader::new(file);
        let mut buf = vec![0u8; CHUNK_SIZE];

        for index in 0..total_chunks {
            if context.state.read().await.status != TransferStatus::Active {
                tracing::debug!("chunk stream for {} stopped early", id.short());
                return Ok(());
            }

            let offset = index * chunk_size;
            let len = (size - offset).min(chunk_size) as usize;
            reader.read_exact(&mut buf[..len]).await?;

            let payload = TransferPayload::Data {
                transfer_id: id,
                chunk_index: index,
                data: BASE64.encode(&buf[..len]),
                is_last: index + 1 == total_chunks,
            };
            self.send_payload(peer, &payload).await?;

            {
                let mut state = context.state.write().await;
                state.bytes_transferred += len as u64;
            }
            self.notify(context).await;

            tracing::trace!(
                "sent chunk {}/{} of transfer {}",
                index + 1,
                total_chunks,
                id.short()
            );
        }

        tracing::info!(
            "all {} chunk(s) of transfer {} sent, awaiting confirmation",
            total_chunks,
            id.short()
        );
        Ok(())
    }

    async fn handle_reject(&self, peer: NodeId, id: TransferId) {
        let Some(context) = self.context_for(peer, id, Direction::Send).await else {
            return;
        };

        {
            let mut state = context.state.write().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = TransferStatus::Cancelled;
            state.completed_at = Some(unix_now());
        }
        self.notify(&context).await;
        tracing::info!("transfer {} rejected by peer", id.short());
    }

    async fn handle_data(
        &self,
        peer: NodeId,
        id: TransferId,
        chunk_index: u64,
        data: &str,
        is_last: bool,
    ) {
        let Some(context) = self.context_for(peer, id, Direction::Receive).await else {
            return;
        };

        {
            let state = context.state.read().await;
            if state.status != TransferStatus::Active {
                return;
            }

            let expected = state.bytes_transferred / CHUNK_SIZE as u64;
            if chunk_index != expected {
                drop(state);
                self.fail(
                    &context,
                    format!("chunk {chunk_index} arrived, expected {expected}"),
                )
                .await;
                return;
            }
        }

        let chunk = match BASE64.decode(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.fail(&context, format!("chunk decode failed: {e}")).await;
                return;
            }
        };

        let (size, bytes_after) = {
            let state = context.state.read().await;
            (state.size, state.bytes_transferred + chunk.len() as u64)
        };
        if bytes_after > size {
            self.fail(&context, "more data than the offer declared".to_string())
                .await;
            return;
        }

        {
            let mut file = context.file.lock().await;
            let Some(handle) = file.as_mut() else {
                self.fail(&context, "destination handle missing".to_string()).await;
                return;
            };
            if let Err(e) = handle.write_all(&chunk).await {
                drop(file);
                self.fail(&context, format!("write failed: {e}")).await;
                return;
            }
        }

        {
            let mut state = context.state.write().await;
            state.bytes_transferred = bytes_after;
        }
        self.notify(&context).await;

        if is_last {
            self.finish_receive(&context, peer, id, size, bytes_after).await;
        }
    }

    /// Close the destination, verify the digest and reach a terminal state.
    async fn finish_receive(
        &self,
        context: &Arc<TransferContext>,
        peer: NodeId,
        id: TransferId,
        size: u64,
        received: u64,
    ) {
        {
            let mut file = context.file.lock().await;
            if let Some(handle) = file.take() {
                if let Err(e) = handle.sync_all().await {
                    self.fail(context, format!("flush failed: {e}")).await;
                    return;
                }
            }
        }

        if received != size {
            self.fail(
                context,
                format!("received {received} bytes, offer declared {size}"),
            )
            .await;
            return;
        }

        let (path, expected) = {
            let state = context.state.read().await;
            (state.path.clone(), state.checksum.clone())
        };
        let digest = tokio::task::spawn_blocking(move || sha256_file_hex(&path)).await;

        match digest {
            Ok(Ok(digest)) if digest == expected => {
                {
                    let mut state = context.state.write().await;
                    if state.status.is_terminal() {
                        return;
                    }
                    state.status = TransferStatus::Completed;
                    state.completed_at = Some(unix_now());
                }
                self.notify(context).await;
                tracing::info!("transfer {} completed, digest verified", id.short());

                if let Err(e) = self
                    .send_payload(peer, &TransferPayload::Complete { transfer_id: id })
                    .await
                {
                    tracing::debug!("complete for {} not transmitted: {}", id.short(), e);
                }
            }
            Ok(Ok(_)) => {
                self.fail(context, "integrity check failed".to_string()).await;
            }
            Ok(Err(e)) => {
                self.fail(context, format!("digest computation failed: {e}")).await;
            }
            Err(e) => {
                self.fail(context, format!("digest task failed: {e}")).await;
            }
        }
    }

    async fn handle_complete(&self, peer: NodeId, id: TransferId) {
        let Some(context) = self.context_for(peer, id, Direction::Send).await else {
            return;
        };

        {
            let mut state = context.state.write().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = TransferStatus::Completed;
            state.bytes_transferred = state.size;
            state.completed_at = Some(unix_now());
        }
        self.notify(&context).await;
        tracing::info!("transfer {} confirmed complete by receiver", id.short());
    }

    async fn handle_cancel(&self, peer: NodeId, id: TransferId) {
        let Some(entry) = self.inner.transfers.get(&id).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let cancelled = {
            let mut state = entry.state.write().await;
            if state.peer != peer || state.status.is_terminal() {
                false
            } else {
                state.status = TransferStatus::Cancelled;
                state.completed_at = Some(unix_now());
                true
            }
        };
        if cancelled {
            self.release_file(&entry).await;
            self.notify(&entry).await;
            tracing::info!("transfer {} cancelled by peer", id.short());
        }
    }

    // ============ Queries ============

    /// Snapshot of one transfer.
    pub async fn transfer(&self, id: TransferId) -> Option<Transfer> {
        let context = self.inner.transfers.get(&id).map(|e| Arc::clone(e.value()))?;
        Some(context.state.read().await.clone())
    }

    /// Snapshots of all transfers of this session.
    pub async fn transfers(&self) -> Vec<Transfer> {
        let contexts: Vec<Arc<TransferContext>> = self
            .inner
            .transfers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut snapshots = Vec::with_capacity(contexts.len());
        for context in contexts {
            snapshots.push(context.state.read().await.clone());
        }
        snapshots
    }

    // ============ Internals ============

    /// Look up a transfer and check it belongs to the peer and direction the
    /// message claims; mismatches are dropped.
    async fn context_for(
        &self,
        peer: NodeId,
        id: TransferId,
        direction: Direction,
    ) -> Option<Arc<TransferContext>> {
        let context = self.inner.transfers.get(&id).map(|e| Arc::clone(e.value()))?;
        let state = context.state.read().await;
        if state.peer != peer || state.direction != direction {
            tracing::debug!(
                "transfer message for {} from unexpected peer {}",
                id.short(),
                peer.short()
            );
            return None;
        }
        drop(state);
        Some(context)
    }

    async fn cancel_local(&self, context: &Arc<TransferContext>) {
        {
            let mut state = context.state.write().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = TransferStatus::Cancelled;
            state.completed_at = Some(unix_now());
            tracing::info!("transfer {} cancelled, connection lost", state.id.short());
        }
        self.release_file(context).await;
        self.notify(context).await;
    }

    async fn fail(&self, context: &Arc<TransferContext>, error: String) {
        {
            let mut state = context.state.write().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = TransferStatus::Failed;
            state.error = Some(error.clone());
            state.completed_at = Some(unix_now());
            tracing::warn!("transfer {} failed: {}", state.id.short(), error);
        }
        self.release_file(context).await;
        self.notify(context).await;
    }

    async fn release_file(&self, context: &Arc<TransferContext>) {
        let _ = context.file.lock().await.take();
    }

    async fn notify(&self, context: &Arc<TransferContext>) {
        let snapshot = context.state.read().await.clone();
        let _ = self.inner.updates.send(snapshot);
    }

    async fn send_payload(&self, peer: NodeId, payload: &TransferPayload) -> Result<()> {
        let bytes = protocol::encode_transfer(payload)?;
        self.inner
            .transport
            .send(peer, PROTOCOL_TRANSFER, bytes)
            .await?;
        Ok(())
    }
}

/// Pick a destination that does not collide with an existing download:
/// `photo.jpg`, `photo (1).jpg`, `photo (2).jpg`, ...
fn dedup_path(dir: &Path, basename: &str) -> PathBuf {
    let candidate = dir.join(basename);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(basename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| basename.to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 1.. {
        let name = match &extension {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("dedup counter exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use rand_core::{OsRng, RngCore};
    use shario_crypto::hash::sha256_hex;
    use shario_crypto::signatures::SigningKey;
    use shario_transport::{TransportConfig, TransportEvent};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        manager: TransferManager,
        transport_tx: mpsc::Sender<TransportEvent>,
        downloads: PathBuf,
        _shutdown_tx: watch::Sender<bool>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let downloads = dir.path().join("downloads");

        let signing = Arc::new(SigningKey::generate(&mut OsRng).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (transport_tx, transport_rx) = mpsc::channel(256);
        let (event_tx, _event_rx) = mpsc::channel(64);
        let transport = TransportHost::new(
            signing,
            TransportConfig::default(),
            event_tx,
            shutdown_rx.clone(),
        );

        let registry = SessionRegistry::new(transport.clone());
        let manager = TransferManager::new(transport, downloads.clone());
        manager.start(&registry, shutdown_rx.clone());
        registry.run(transport_rx, shutdown_rx);

        Harness {
            manager,
            transport_tx,
            downloads,
            _shutdown_tx: shutdown_tx,
            _dir: dir,
        }
    }

    fn random_node_id() -> NodeId {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        NodeId::from_bytes(bytes)
    }

    async fn send_transfer_msg(harness: &Harness, peer: NodeId, payload: &TransferPayload) {
        harness
            .transport_tx
            .send(TransportEvent::Message {
                peer,
                protocol: PROTOCOL_TRANSFER.to_string(),
                payload: protocol::encode_transfer(payload).unwrap(),
            })
            .await
            .unwrap();
    }

    async fn wait_for_status(
        manager: &TransferManager,
        id: TransferId,
        status: TransferStatus,
    ) -> Transfer {
        for _ in 0..100 {
            if let Some(snapshot) = manager.transfer(id).await {
                if snapshot.status == status {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("transfer never reached {status:?}");
    }

    fn accept_all(manager: &TransferManager) {
        manager.set_offer_handler(Arc::new(|_| true));
    }

    /// Drive a complete inbound transfer through the manager.
    async fn receive_file(harness: &Harness, data: &[u8]) -> (TransferId, Transfer) {
        let peer = random_node_id();
        let id = TransferId::random();
        let checksum = sha256_hex(data);

        send_transfer_msg(
            harness,
            peer,
            &TransferPayload::Offer {
                transfer_id: id,
                filename: "blob.bin".to_string(),
                size: data.len() as u64,
                checksum,
            },
        )
        .await;
        wait_for_status(&harness.manager, id, TransferStatus::Active).await;

        let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            send_transfer_msg(
                harness,
                peer,
                &TransferPayload::Data {
                    transfer_id: id,
                    chunk_index: index as u64,
                    data: BASE64.encode(chunk),
                    is_last: index + 1 == chunks.len(),
                },
            )
            .await;
        }

        let snapshot = wait_for_status(&harness.manager, id, TransferStatus::Completed).await;
        (id, snapshot)
    }

    #[test]
    fn test_transfer_id_round_trip() {
        let id = TransferId::random();
        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<TransferId>().unwrap(), id);
    }

    #[test]
    fn test_progress_invariants() {
        let mut transfer = Transfer {
            id: TransferId::from_bytes([1u8; 32]),
            filename: "f".to_string(),
            size: 1000,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            direction: Direction::Receive,
            peer: NodeId::from_bytes([2u8; 32]),
            path: PathBuf::from("/tmp/f"),
            checksum: String::new(),
            started_at: 0,
            completed_at: None,
            error: None,
        };

        assert_eq!(transfer.progress(), 0);

        transfer.bytes_transferred = 500;
        assert_eq!(transfer.progress(), 50);

        // All bytes moved but not verified: capped below 100.
        transfer.bytes_transferred = 1000;
        transfer.status = TransferStatus::Active;
        assert_eq!(transfer.progress(), 99);

        transfer.status = TransferStatus::Completed;
        assert_eq!(transfer.progress(), 100);
    }

    #[test]
    fn test_dedup_path() {
        let dir = TempDir::new().unwrap();
        let first = dedup_path(dir.path(), "photo.jpg");
        assert_eq!(first, dir.path().join("photo.jpg"));

        std::fs::write(&first, b"x").unwrap();
        let second = dedup_path(dir.path(), "photo.jpg");
        assert_eq!(second, dir.path().join("photo (1).jpg"));

        std::fs::write(&second, b"x").unwrap();
        let third = dedup_path(dir.path(), "photo.jpg");
        assert_eq!(third, dir.path().join("photo (2).jpg"));
    }

    #[tokio::test]
    async fn test_receive_small_file_end_to_end() {
        let harness = harness();
        accept_all(&harness.manager);

        let (_, snapshot) = receive_file(&harness, b"hello").await;

        assert_eq!(snapshot.progress(), 100);
        assert_eq!(snapshot.bytes_transferred, 5);
        assert!(snapshot.completed_at.is_some());

        let written = std::fs::read(&snapshot.path).unwrap();
        assert_eq!(written, b"hello");
        assert_eq!(snapshot.path, harness.downloads.join("blob.bin"));
    }

    #[tokio::test]
    async fn test_receive_multi_chunk_file() {
        let harness = harness();
        accept_all(&harness.manager);

        let data: Vec<u8> = (0u32..3000).flat_map(|i| i.to_le_bytes()).collect();
        let (_, snapshot) = receive_file(&harness, &data).await;

        assert_eq!(snapshot.bytes_transferred, data.len() as u64);
        assert_eq!(std::fs::read(&snapshot.path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_offer_without_handler_is_rejected() {
        let harness = harness();
        let peer = random_node_id();
        let id = TransferId::random();

        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Offer {
                transfer_id: id,
                filename: "nope.bin".to_string(),
                size: 10,
                checksum: "00".repeat(32),
            },
        )
        .await;

        let snapshot = wait_for_status(&harness.manager, id, TransferStatus::Cancelled).await;
        assert_eq!(snapshot.direction, Direction::Receive);
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails_transfer() {
        let harness = harness();
        accept_all(&harness.manager);
        let peer = random_node_id();
        let id = TransferId::random();

        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Offer {
                transfer_id: id,
                filename: "corrupt.bin".to_string(),
                size: 5,
                checksum: "00".repeat(32),
            },
        )
        .await;
        wait_for_status(&harness.manager, id, TransferStatus::Active).await;

        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Data {
                transfer_id: id,
                chunk_index: 0,
                data: BASE64.encode(b"hello"),
                is_last: true,
            },
        )
        .await;

        let snapshot = wait_for_status(&harness.manager, id, TransferStatus::Failed).await;
        assert!(snapshot.error.as_ref().unwrap().contains("integrity"));
        assert!(snapshot.progress() < 100);
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_fails_transfer() {
        let harness = harness();
        accept_all(&harness.manager);
        let peer = random_node_id();
        let id = TransferId::random();

        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Offer {
                transfer_id: id,
                filename: "ooo.bin".to_string(),
                size: 4096,
                checksum: "00".repeat(32),
            },
        )
        .await;
        wait_for_status(&harness.manager, id, TransferStatus::Active).await;

        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Data {
                transfer_id: id,
                chunk_index: 2,
                data: BASE64.encode(vec![0u8; CHUNK_SIZE]),
                is_last: false,
            },
        )
        .await;

        let snapshot = wait_for_status(&harness.manager, id, TransferStatus::Failed).await;
        assert!(snapshot.error.as_ref().unwrap().contains("expected 0"));
    }

    #[tokio::test]
    async fn test_peer_cancel_is_terminal() {
        let harness = harness();
        accept_all(&harness.manager);
        let peer = random_node_id();
        let id = TransferId::random();

        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Offer {
                transfer_id: id,
                filename: "partial.bin".to_string(),
                size: 4096,
                checksum: "00".repeat(32),
            },
        )
        .await;
        wait_for_status(&harness.manager, id, TransferStatus::Active).await;

        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Data {
                transfer_id: id,
                chunk_index: 0,
                data: BASE64.encode(vec![7u8; CHUNK_SIZE]),
                is_last: false,
            },
        )
        .await;
        send_transfer_msg(&harness, peer, &TransferPayload::Cancel { transfer_id: id }).await;

        let snapshot = wait_for_status(&harness.manager, id, TransferStatus::Cancelled).await;
        assert_eq!(snapshot.bytes_transferred, CHUNK_SIZE as u64);

        // A late chunk must not revive the transfer.
        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Data {
                transfer_id: id,
                chunk_index: 1,
                data: BASE64.encode(vec![7u8; CHUNK_SIZE]),
                is_last: false,
            },
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = harness.manager.transfer(id).await.unwrap();
        assert_eq!(snapshot.status, TransferStatus::Cancelled);
        assert_eq!(snapshot.bytes_transferred, CHUNK_SIZE as u64);
    }

    #[tokio::test]
    async fn test_peer_disconnect_cancels_non_terminal_transfers() {
        let harness = harness();
        accept_all(&harness.manager);
        let peer = random_node_id();
        let id = TransferId::random();

        send_transfer_msg(
            &harness,
            peer,
            &TransferPayload::Offer {
                transfer_id: id,
                filename: "doomed.bin".to_string(),
                size: 4096,
                checksum: "00".repeat(32),
            },
        )
        .await;
        wait_for_status(&harness.manager, id, TransferStatus::Active).await;

        // The registry needs to have seen the peer for the disconnect event.
        harness
            .transport_tx
            .send(TransportEvent::ConnectionOpened {
                peer,
                addr: "127.0.0.1:5555".parse().unwrap(),
            })
            .await
            .unwrap();
        harness
            .transport_tx
            .send(TransportEvent::ConnectionClosed {
                peer,
                addr: "127.0.0.1:5555".parse().unwrap(),
            })
            .await
            .unwrap();

        wait_for_status(&harness.manager, id, TransferStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn test_send_file_requires_connection() {
        let harness = harness();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"data").unwrap();

        let err = harness
            .manager
            .send_file(random_node_id(), &path)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Transport(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_send_file_rejects_empty_file() {
        let harness = harness();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let err = harness
            .manager
            .send_file(random_node_id(), &path)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Transfer(_)));
    }

    #[tokio::test]
    async fn test_update_subscriber_sees_progress() {
        let harness = harness();
        accept_all(&harness.manager);
        let mut updates = harness.manager.subscribe();

        let data = vec![1u8; CHUNK_SIZE * 2];
        let (id, _) = receive_file(&harness, &data).await;

        // Let the final notification land before draining.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Collect snapshots for this transfer; progress must be monotone.
        let mut last = 0u8;
        let mut saw_completed = false;
        while let Ok(snapshot) = updates.try_recv() {
            if snapshot.id != id {
                continue;
            }
            assert!(snapshot.progress() >= last);
            last = snapshot.progress();
            if snapshot.status == TransferStatus::Completed {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
        assert_eq!(last, 100);
    }
}
