//! Relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (documentId) ── op log (dedup by OpId) ── BroadcastGroup
//! Client B ──┘          │
//!                       └── dyn Persistence (optional, full snapshot per append)
//!
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! The relay never interprets text. It keeps the union of all ops it has
//! seen per document in causal order (ops whose dependencies have not
//! arrived yet are held back), answers `syncStep1` with the ops the peer lacks,
//! asks back with its own state vector, and fans out every new op as an
//! `update` to the other connections of the room. Awareness and leave
//! frames are forwarded verbatim.
//!
//! Connections are served over any [`Link`]: the TCP listener wraps
//! WebSockets, [`MemoryTransport`] hands in channel pairs.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 & 8
//!
//! [`MemoryTransport`]: crate::transport::MemoryTransport

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Fanout, PeerInfo};
use crate::crdt::{OpId, Operation, StateVector};
use crate::protocol::{Payload, ProtocolError, SyncMessage};
use crate::storage::{Persistence, PersistedSnapshot, PersistenceError, RocksStore, StoreConfig, StoreError};
use crate::transport::{FrameSink, Link, TransportError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, small rooms, no storage.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 16,
            broadcast_capacity: 64,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub ops_appended: u64,
    pub persisted_snapshots: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("room {0} is full")]
    RoomFull(String),
}

/// Ops waiting for their dependencies before they may enter a room log.
const MAX_HELD_OPS: usize = 4096;

/// Causally ordered union of every op the relay has seen for one document.
///
/// An op enters the log only once its site's previous counter and its
/// origins (or delete target) are already in, so every prefix the log
/// serves can be applied by any replica. Early ops are held until then.
#[derive(Debug, Default)]
struct RoomLog {
    ops: Vec<Operation>,
    seen: HashSet<OpId>,
    vector: StateVector,
    held: Vec<Operation>,
}

impl RoomLog {
    fn from_operations(ops: Vec<Operation>) -> Self {
        let mut log = Self::default();
        log.append(ops);
        log
    }

    /// Append unseen ops, returning the ones that entered the log in log
    /// order. Ops that arrive ahead of their dependencies are held back.
    fn append(&mut self, ops: Vec<Operation>) -> Vec<Operation> {
        let mut fresh = Vec::new();
        for op in ops {
            let id = op.id();
            if self.seen.contains(&id) || self.held.iter().any(|h| h.id() == id) {
                continue;
            }
            if self.is_ready(&op) {
                self.admit(op, &mut fresh);
                self.release_held(&mut fresh);
            } else {
                self.hold(op);
            }
        }
        fresh
    }

    fn is_ready(&self, op: &Operation) -> bool {
        let id = op.id();
        id.counter == self.vector.get(id.site) + 1 && op.dependencies().all(|dep| self.seen.contains(&dep))
    }

    fn admit(&mut self, op: Operation, fresh: &mut Vec<Operation>) {
        let id = op.id();
        self.seen.insert(id);
        self.vector.observe(id);
        self.ops.push(op.clone());
        fresh.push(op);
    }

    fn release_held(&mut self, fresh: &mut Vec<Operation>) {
        loop {
            let ready = self.held.iter().position(|op| self.is_ready(op));
            let Some(pos) = ready else { break };
            let op = self.held.remove(pos);
            self.admit(op, fresh);
        }
    }

    fn hold(&mut self, op: Operation) {
        if self.held.len() >= MAX_HELD_OPS {
            let dropped = self.held.remove(0);
            log::warn!("Held op buffer full; dropping {}", dropped.id());
        }
        log::debug!("Holding {} until its dependencies arrive", op.id());
        self.held.push(op);
    }

    fn ops_since(&self, remote: &StateVector) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|op| !remote.contains(op.id()))
            .cloned()
            .collect()
    }
}

/// Document room: op log + broadcast group.
struct DocumentRoom {
    document_id: String,
    log: Mutex<RoomLog>,
    broadcast: BroadcastGroup,
}

impl DocumentRoom {
    fn new(document_id: &str, log: RoomLog, broadcast_capacity: usize) -> Self {
        Self {
            document_id: document_id.to_string(),
            log: Mutex::new(log),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }
}

/// Per-connection room membership, set by `join`.
struct Binding {
    room: Arc<DocumentRoom>,
    user_id: String,
    /// Awareness client announced on this connection, if any.
    client_id: Option<String>,
    rx: broadcast::Receiver<Fanout>,
    /// The peer said goodbye itself; no synthetic leave on disconnect.
    left: bool,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    stats: RwLock<ServerStats>,
    store: Option<Arc<dyn Persistence>>,
}

impl SyncServer {
    /// In-memory relay. `storage_path` is ignored; see [`SyncServer::open`].
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            stats: RwLock::new(ServerStats::default()),
            store: None,
        }
    }

    /// Relay backed by the given persistence.
    pub fn with_store(config: ServerConfig, store: Arc<dyn Persistence>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    /// Relay per config: RocksDB at `storage_path` when set, else in-memory.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        match config.storage_path.clone() {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path,
                    ..StoreConfig::default()
                })?;
                Ok(Self::with_store(config, Arc::new(store)))
            }
            None => Ok(Self::new(config)),
        }
    }

    /// Load every persisted document into a room so reconnecting peers
    /// find it immediately.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return Ok(0),
        };

        let document_ids = store.list_documents().await?;
        let mut recovered = 0;
        for document_id in &document_ids {
            match store.load(document_id).await {
                Ok(Some(snapshot)) => {
                    let log = RoomLog::from_operations(snapshot.operations);
                    let mut rooms = self.rooms.write().await;
                    rooms.entry(document_id.clone()).or_insert_with(|| {
                        Arc::new(DocumentRoom::new(document_id, log, self.config.broadcast_capacity))
                    });
                    recovered += 1;
                    log::info!("Recovered document {document_id} from storage");
                }
                Ok(None) => {}
                Err(e) => log::error!("Failed to recover document {document_id}: {e}"),
            }
        }

        self.stats.write().await.active_rooms = self.rooms.read().await.len();
        log::info!("Recovery complete: {recovered}/{} documents restored", document_ids.len());
        Ok(recovered)
    }

    /// Recover, bind `config.bind_addr`, and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Recover, then accept WebSocket connections on `listener` forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_socket(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| ServerError::Handshake(e.to_string()))?;
        log::info!("WebSocket connection established from {addr}");
        self.serve_link(crate::transport::websocket_link(ws), addr.to_string()).await;
        Ok(())
    }

    /// Serve one connection until it closes.
    pub async fn serve_link(self: Arc<Self>, link: Link, label: String) {
        let Link { mut sink, mut stream } = link;
        let connection_id = Uuid::new_v4();
        let mut binding: Option<Binding> = None;

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.handle_frame(connection_id, &label, &frame, &mut binding, &mut sink).await {
                            log::warn!("Closing {label}: {e}");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Receive error from {label}: {e}");
                        break;
                    }
                    None => {
                        log::info!("Connection {label} closed");
                        break;
                    }
                },

                fanout = recv_fanout(&mut binding) => match fanout {
                    Ok(item) => {
                        // Don't echo back to sender
                        if item.origin == connection_id {
                            continue;
                        }
                        if let Err(e) = sink.send(item.frame.to_string()).await {
                            log::warn!("Send to {label} failed: {e}");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        if let Some(b) = &binding {
                            b.room.broadcast.record_lag(n);
                            log::warn!("{label} lagged by {n} frames; resending room log");
                            let ops = b.room.log.lock().await.ops.clone();
                            let catch_up = SyncMessage::sync_step2(b.room.document_id.clone(), ops);
                            if let Err(e) = send_message(&mut sink, &catch_up).await {
                                log::warn!("Send to {label} failed: {e}");
                                break;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.disconnect(connection_id, binding).await;
    }

    async fn handle_frame(
        &self,
        connection_id: Uuid,
        label: &str,
        frame: &str,
        binding: &mut Option<Binding>,
        sink: &mut FrameSink,
    ) -> Result<(), ServerError> {
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += frame.len() as u64;
        }

        let msg = match SyncMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping frame from {label}: {e}");
                self.stats.write().await.rejected_messages += 1;
                return Ok(());
            }
        };

        if let Some(b) = binding.as_ref() {
            if let Err(e) = msg.ensure_document(&b.room.document_id) {
                log::warn!("Dropping frame from {label}: {e}");
                self.stats.write().await.rejected_messages += 1;
                return Ok(());
            }
        }

        let document_id = msg.document_id;
        match (msg.payload, binding.as_mut()) {
            (Payload::Join { user_id }, None) => {
                let peer = PeerInfo::new(connection_id, user_id.clone());
                let (room, rx) = self.join_room(&document_id, peer).await?;
                // Peers re-announce their awareness when they see a join.
                room.broadcast.broadcast_raw(connection_id, Arc::from(frame));
                log::info!("{user_id} joined document {document_id} via {label}");
                *binding = Some(Binding {
                    room,
                    user_id,
                    client_id: None,
                    rx,
                    left: false,
                });
            }
            (Payload::Join { user_id }, Some(b)) => {
                log::debug!("{label} sent a second join as {user_id}; keeping {}", b.user_id);
            }
            (payload, None) => {
                log::warn!("{label} sent {:?} before join; dropping", payload.message_type());
                self.stats.write().await.rejected_messages += 1;
            }
            (Payload::SyncStep1 { state_vector }, Some(b)) => {
                let (missing, vector) = {
                    let room_log = b.room.log.lock().await;
                    (room_log.ops_since(&state_vector), room_log.vector.clone())
                };
                log::debug!("Sending {} missing ops to {label}", missing.len());
                send_message(sink, &SyncMessage::sync_step2(document_id.clone(), missing)).await?;
                send_message(sink, &SyncMessage::sync_step1(document_id, vector)).await?;
            }
            (Payload::SyncStep2 { ops } | Payload::Update { ops }, Some(b)) => {
                self.append(&b.room, connection_id, ops).await?;
            }
            (Payload::AwarenessUpdate { client_id, .. }, Some(b)) => {
                b.client_id = Some(client_id);
                b.room.broadcast.broadcast_raw(connection_id, Arc::from(frame));
            }
            (Payload::Heartbeat, Some(b)) => {
                log::trace!("Heartbeat from {} on {label}", b.user_id);
            }
            (Payload::Leave { user_id, .. }, Some(b)) => {
                log::info!("{user_id} left document {document_id}");
                b.left = true;
                b.room.broadcast.broadcast_raw(connection_id, Arc::from(frame));
            }
        }

        Ok(())
    }

    /// Append to the room log, fan out what was new, persist.
    ///
    /// Runs under the room lock so every peer sees updates in log order and
    /// snapshots are written in order.
    async fn append(&self, room: &DocumentRoom, origin: Uuid, ops: Vec<Operation>) -> Result<(), ServerError> {
        let mut room_log = room.log.lock().await;
        let fresh = room_log.append(ops);
        if fresh.is_empty() {
            return Ok(());
        }

        let appended = fresh.len() as u64;
        room.broadcast
            .broadcast(origin, &SyncMessage::update(room.document_id.clone(), fresh))?;

        let mut persisted = 0;
        if let Some(store) = &self.store {
            let snapshot = PersistedSnapshot::new(
                room.document_id.clone(),
                room_log.ops.clone(),
                room_log.vector.clone(),
            );
            match store.save(&snapshot).await {
                Ok(()) => persisted = 1,
                Err(e) => log::error!("Failed to persist document {}: {e}", room.document_id),
            }
        }
        drop(room_log);

        let mut s = self.stats.write().await;
        s.ops_appended += appended;
        s.persisted_snapshots += persisted;
        Ok(())
    }

    /// Get or create the room and register the peer, atomically with
    /// respect to empty-room cleanup.
    async fn join_room(
        &self,
        document_id: &str,
        peer: PeerInfo,
    ) -> Result<(Arc<DocumentRoom>, broadcast::Receiver<Fanout>), ServerError> {
        let existing = self.rooms.read().await.get(document_id).cloned();
        let restored = match existing {
            Some(_) => None,
            None => Some(self.load_log(document_id).await),
        };

        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(document_id) {
            Some(room) => room.clone(),
            None => {
                let log = restored.unwrap_or_default();
                let room = Arc::new(DocumentRoom::new(document_id, log, self.config.broadcast_capacity));
                rooms.insert(document_id.to_string(), room.clone());
                room
            }
        };

        if room.broadcast.peer_count().await >= self.config.max_peers_per_room {
            return Err(ServerError::RoomFull(document_id.to_string()));
        }
        let rx = room.broadcast.add_peer(peer).await;
        let room_count = rooms.len();
        drop(rooms);

        self.stats.write().await.active_rooms = room_count;
        Ok((room, rx))
    }

    async fn load_log(&self, document_id: &str) -> RoomLog {
        let Some(store) = &self.store else {
            return RoomLog::default();
        };
        match store.load(document_id).await {
            Ok(Some(snapshot)) => {
                log::info!("Loaded {} persisted ops for {document_id}", snapshot.operations.len());
                RoomLog::from_operations(snapshot.operations)
            }
            Ok(None) => RoomLog::default(),
            Err(e) => {
                log::error!("Failed to load document {document_id}: {e}");
                RoomLog::default()
            }
        }
    }

    async fn disconnect(&self, connection_id: Uuid, binding: Option<Binding>) {
        let mut room_count = None;
        if let Some(b) = binding {
            let document_id = b.room.document_id.clone();
            b.room.broadcast.remove_peer(&connection_id).await;

            if !b.left {
                let leave = match &b.client_id {
                    Some(client_id) => SyncMessage::leave_client(document_id.clone(), b.user_id.clone(), client_id.clone()),
                    None => SyncMessage::leave(document_id.clone(), b.user_id.clone()),
                };
                if let Err(e) = b.room.broadcast.broadcast(connection_id, &leave) {
                    log::warn!("Failed to announce departure of {}: {e}", b.user_id);
                }
            }

            let mut rooms = self.rooms.write().await;
            if b.room.broadcast.peer_count().await == 0 {
                rooms.remove(&document_id);
                log::info!("Room {document_id} removed (empty)");
            }
            room_count = Some(rooms.len());
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        if let Some(count) = room_count {
            s.active_rooms = count;
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ops held for a document, if its room is open.
    pub async fn room_operations(&self, document_id: &str) -> Option<Vec<Operation>> {
        let room = self.rooms.read().await.get(document_id).cloned()?;
        let ops = room.log.lock().await.ops.clone();
        Some(ops)
    }

    /// Connections currently in a document's room.
    pub async fn room_peers(&self, document_id: &str) -> usize {
        let room = self.rooms.read().await.get(document_id).cloned();
        match room {
            Some(room) => room.broadcast.peer_count().await,
            None => 0,
        }
    }
}

async fn recv_fanout(binding: &mut Option<Binding>) -> Result<Fanout, RecvError> {
    match binding {
        Some(b) => b.rx.recv().await,
        // Not in a room yet: wait forever
        None => std::future::pending().await,
    }
}

async fn send_message(sink: &mut FrameSink, msg: &SyncMessage) -> Result<(), ServerError> {
    sink.send(msg.encode()?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Document, SiteId};
    use crate::storage::MemoryStore;
    use crate::transport::{MemoryTransport, Transport};

    async fn next_message(link: &mut Link) -> SyncMessage {
        let frame = link.stream.next().await.unwrap().unwrap();
        SyncMessage::decode(&frame).unwrap()
    }

    async fn send(link: &mut Link, msg: SyncMessage) {
        link.sink.send(msg.encode().unwrap()).await.unwrap();
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_room_log_dedups() {
        let mut doc = Document::new(SiteId::from_u128(1));
        let ops = doc.local_insert(0, "abc").unwrap();

        let mut log = RoomLog::default();
        assert_eq!(log.append(ops.clone()).len(), 3);
        assert!(log.append(ops).is_empty());
        assert_eq!(log.ops.len(), 3);
        assert_eq!(&log.vector, doc.state_vector());
    }

    #[test]
    fn test_room_log_holds_ops_until_dependencies_arrive() {
        let mut doc = Document::new(SiteId::from_u128(1));
        let ops = doc.local_insert(0, "ab").unwrap();

        let mut log = RoomLog::default();
        // Counter 2 without counter 1 stays out of the log.
        assert!(log.append(vec![ops[1].clone()]).is_empty());
        assert!(log.ops.is_empty());
        assert!(log.ops_since(&StateVector::new()).is_empty());
        assert_eq!(log.held.len(), 1);

        // Once the gap closes both enter in causal order.
        assert_eq!(log.append(vec![ops[0].clone()]), ops);
        assert!(log.held.is_empty());
        assert_eq!(&log.vector, doc.state_vector());
    }

    #[test]
    fn test_room_log_holds_ops_with_unknown_origins() {
        let mut a = Document::new(SiteId::from_u128(1));
        let base = a.local_insert(0, "x").unwrap();
        let mut b = Document::from_operations(SiteId::from_u128(2), base.clone());
        let reply = b.local_insert(1, "y").unwrap();

        let mut log = RoomLog::default();
        assert!(log.append(reply.clone()).is_empty());
        let fresh = log.append(base.clone());
        assert_eq!(fresh, [base, reply].concat());
    }

    #[tokio::test]
    async fn test_sync_step1_returns_only_missing_ops() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = MemoryTransport::new(server.clone());

        let mut doc = Document::new(SiteId::from_u128(1));
        let first = doc.local_insert(0, "abc").unwrap();
        let checkpoint = doc.state_vector().clone();
        let second = doc.local_insert(3, "de").unwrap();

        let mut writer = transport.connect("d").await.unwrap();
        send(&mut writer, SyncMessage::join("d", "w")).await;
        send(&mut writer, SyncMessage::update("d", first)).await;
        send(&mut writer, SyncMessage::update("d", second.clone())).await;
        // Frames are handled in order: once this is answered both updates are in.
        send(&mut writer, SyncMessage::sync_step1("d", doc.state_vector().clone())).await;
        assert_eq!(next_message(&mut writer).await.payload, Payload::SyncStep2 { ops: vec![] });

        let mut reader = transport.connect("d").await.unwrap();
        send(&mut reader, SyncMessage::join("d", "r")).await;
        send(&mut reader, SyncMessage::sync_step1("d", checkpoint)).await;

        assert_eq!(next_message(&mut reader).await.payload, Payload::SyncStep2 { ops: second });
        match next_message(&mut reader).await.payload {
            Payload::SyncStep1 { state_vector } => assert_eq!(&state_vector, doc.state_vector()),
            other => panic!("expected relay state vector, got {other:?}"),
        }
        assert_eq!(server.room_operations("d").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_updates_fan_out_without_echo() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = MemoryTransport::new(server.clone());

        let mut alice = transport.connect("d").await.unwrap();
        send(&mut alice, SyncMessage::join("d", "alice")).await;
        let mut bob = transport.connect("d").await.unwrap();
        send(&mut bob, SyncMessage::join("d", "bob")).await;

        // Alice learns that bob joined.
        assert_eq!(next_message(&mut alice).await.payload, Payload::Join { user_id: "bob".into() });

        let mut doc = Document::new(SiteId::from_u128(1));
        let ops = doc.local_insert(0, "hi").unwrap();
        send(&mut alice, SyncMessage::update("d", ops.clone())).await;
        // Re-sending the same ops is a no-op for the relay.
        send(&mut alice, SyncMessage::sync_step2("d", ops.clone())).await;
        send(&mut alice, SyncMessage::heartbeat("d")).await;

        assert_eq!(next_message(&mut bob).await.payload, Payload::Update { ops });

        // Alice gets no echo: the next thing she sees is bob's leave.
        drop(bob);
        assert_eq!(
            next_message(&mut alice).await.payload,
            Payload::Leave {
                user_id: "bob".into(),
                client_id: None
            }
        );
        assert_eq!(server.stats().await.ops_appended, 2);
    }

    #[tokio::test]
    async fn test_frames_before_join_and_foreign_documents_are_dropped() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = MemoryTransport::new(server.clone());
        let mut link = transport.connect("d").await.unwrap();

        send(&mut link, SyncMessage::heartbeat("d")).await;
        link.sink.send("garbage".to_string()).await.unwrap();
        send(&mut link, SyncMessage::join("d", "alice")).await;
        send(&mut link, SyncMessage::sync_step1("elsewhere", StateVector::new())).await;
        send(&mut link, SyncMessage::sync_step1("d", StateVector::new())).await;

        // Only the valid sync step gets an answer.
        assert_eq!(next_message(&mut link).await.payload, Payload::SyncStep2 { ops: vec![] });
        assert_eq!(server.stats().await.rejected_messages, 3);
    }

    #[tokio::test]
    async fn test_room_full() {
        let config = ServerConfig {
            max_peers_per_room: 1,
            ..ServerConfig::for_testing()
        };
        let server = Arc::new(SyncServer::new(config));
        let transport = MemoryTransport::new(server.clone());

        let mut first = transport.connect("d").await.unwrap();
        send(&mut first, SyncMessage::join("d", "a")).await;
        let mut second = transport.connect("d").await.unwrap();
        send(&mut second, SyncMessage::join("d", "b")).await;

        // The relay hangs up on the second peer.
        assert!(second.stream.next().await.is_none());
        assert_eq!(server.room_peers("d").await, 1);
    }

    #[tokio::test]
    async fn test_appends_are_persisted_and_recovered() {
        let store = Arc::new(MemoryStore::new());
        let server = Arc::new(SyncServer::with_store(ServerConfig::for_testing(), store.clone()));
        let transport = MemoryTransport::new(server.clone());

        let mut doc = Document::new(SiteId::from_u128(1));
        let ops = doc.local_insert(0, "kept").unwrap();
        let mut link = transport.connect("d").await.unwrap();
        send(&mut link, SyncMessage::join("d", "alice")).await;
        send(&mut link, SyncMessage::update("d", ops)).await;
        send(&mut link, SyncMessage::sync_step1("d", StateVector::new())).await;
        let _ = next_message(&mut link).await;

        let saved = store.snapshot("d").unwrap();
        assert_eq!(saved.operations.len(), 4);

        let restarted = SyncServer::with_store(ServerConfig::for_testing(), store);
        assert_eq!(restarted.recover().await.unwrap(), 1);
        assert_eq!(restarted.room_operations("d").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_room_is_removed() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = MemoryTransport::new(server.clone());

        let mut link = transport.connect("d").await.unwrap();
        send(&mut link, SyncMessage::join("d", "alice")).await;
        send(&mut link, SyncMessage::sync_step1("d", StateVector::new())).await;
        let _ = next_message(&mut link).await;
        assert_eq!(server.room_count().await, 1);

        send(&mut link, SyncMessage::leave("d", "alice")).await;
        drop(link);
        for _ in 0..100 {
            if server.room_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.stats().await.active_connections, 0);
    }
}
