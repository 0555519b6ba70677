//! Collaboration session: one open document, end to end.
//!
//! ```text
//!  UI ──► CollabSession (handle) ──cmd──► SessionActor ──► ConnectionManager ──► Transport
//!              ▲                             │  │  │
//!              │      SessionEvent           │  │  └── dyn Persistence (save per local batch)
//!              └─────── broadcast ◄──────────┘  └───── Document + AwarenessRegistry
//! ```
//!
//! Every mutation, local or remote, runs on the actor task, so the engine
//! is never touched from two places at once. The actor selects over:
//!
//! - commands from the handle
//! - frames from the relay
//! - the reconnect deadline owned by the connection manager
//! - the heartbeat timer (heartbeat + own awareness)
//! - the maintenance timer (awareness TTL, causal-gap expiry, deferred saves)
//!
//! Dropping or closing the handle stops the actor: timers go with it,
//! a `leave` is sent when online and the document is flushed to storage.

mod manager;

pub use manager::SessionManager;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::awareness::{
    now_millis, AwarenessPatch, AwarenessRegistry, AwarenessState, DEFAULT_AWARENESS_TTL,
};
use crate::connection::{sleep_until_deadline, ConnectionManager, ConnectionState, ReconnectPolicy};
use crate::crdt::{Document, EngineError, OpId, Operation, SiteId, StateVector};
use crate::diff::{self, EditIntent};
use crate::protocol::{Payload, SyncMessage};
use crate::storage::{PersistedSnapshot, Persistence};
use crate::transport::Transport;

/// Shortest heartbeat or maintenance period a session runs with.
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(10);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Replica id; a fresh one is generated when `None`.
    pub site_id: Option<SiteId>,
    pub user_id: String,
    /// Display name shown next to the cursor.
    pub name: String,
    /// Cursor colour; derived from the user id when `None`.
    pub color: Option<String>,
    pub heartbeat_interval: Duration,
    pub awareness_ttl: Duration,
    /// How long a buffered remote op may wait for its dependencies.
    pub causal_gap_timeout: Duration,
    pub maintenance_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            site_id: None,
            user_id: "anonymous".to_string(),
            name: "Anonymous".to_string(),
            color: None,
            heartbeat_interval: Duration::from_secs(30),
            awareness_ttl: DEFAULT_AWARENESS_TTL,
            causal_gap_timeout: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Default timings with the given identity; name equals the user id.
    pub fn for_testing(user_id: &str) -> Self {
        Self::new(user_id, user_id)
    }

    /// Clamp timer periods to [`MIN_TIMER_INTERVAL`]. Tokio intervals
    /// reject a zero period.
    pub fn normalized(mut self) -> Self {
        self.heartbeat_interval = self.heartbeat_interval.max(MIN_TIMER_INTERVAL);
        self.maintenance_interval = self.maintenance_interval.max(MIN_TIMER_INTERVAL);
        self.event_capacity = self.event_capacity.max(1);
        self
    }
}

/// Whether a content change came from this replica or a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ContentChanged { origin: ChangeOrigin, content: String },
    AwarenessChanged { users: Vec<AwarenessState> },
    StatusChanged(ConnectionState),
    /// Storage failed; the session keeps running in memory only.
    PersistenceDegraded { reason: String },
    /// Buffered ops expired or a bad frame arrived; a fresh sync was asked for.
    ResyncRequested { reason: String },
    /// Reconnect attempts exhausted. Emitted once.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("gave up reconnecting after {attempts} attempts")]
    GaveUp { attempts: u32 },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("no open session for document {0}")]
    UnknownDocument(String),
    #[error("document {document_id} is open for {expected}, not {user_id}")]
    WrongUser {
        document_id: String,
        expected: String,
        user_id: String,
    },
}

enum Command {
    Insert {
        position: usize,
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Delete {
        position: usize,
        length: usize,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ApplyText {
        text: String,
        cursor_hint: usize,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    UpdateAwareness {
        patch: AwarenessPatch,
        reply: oneshot::Sender<Option<AwarenessState>>,
    },
    Content {
        reply: oneshot::Sender<String>,
    },
    ActiveUsers {
        reply: oneshot::Sender<Vec<AwarenessState>>,
    },
    StateVector {
        reply: oneshot::Sender<StateVector>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one open document. Cheap to share behind an `Arc`.
pub struct CollabSession {
    document_id: String,
    user_id: String,
    site_id: SiteId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<ConnectionState>,
    max_attempts: u32,
}

impl CollabSession {
    /// Load the persisted log (if any), start the session task and begin
    /// connecting. Never fails: an unreachable relay means retrying, an
    /// unreadable store means running in memory only.
    pub async fn open(
        document_id: impl Into<String>,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn Persistence>>,
    ) -> Self {
        let document_id = document_id.into();
        let config = config.normalized();
        let site_id = config.site_id.unwrap_or_default();
        let (events, _) = broadcast::channel(config.event_capacity);

        let mut degraded = None;
        let (doc, last_synced, store) = match store {
            Some(store) => match store.load(&document_id).await {
                Ok(Some(snapshot)) => {
                    log::info!(
                        "Resuming document {document_id} from {} persisted ops",
                        snapshot.operations.len()
                    );
                    let doc = Document::from_operations(site_id, snapshot.operations);
                    (doc, snapshot.last_synced_vector, Some(store))
                }
                Ok(None) => (Document::new(site_id), StateVector::new(), Some(store)),
                Err(e) => {
                    log::warn!("Cannot load document {document_id}: {e}; running in memory only");
                    degraded = Some(e.to_string());
                    (Document::new(site_id), StateVector::new(), None)
                }
            },
            None => (Document::new(site_id), StateVector::new(), None),
        };

        let client_id = site_id.to_string();
        let mut awareness = AwarenessRegistry::new(client_id.clone());
        let mut local = AwarenessState::new(client_id, &config.user_id, &config.name, now_millis());
        if let Some(color) = &config.color {
            local.color = color.clone();
        }
        awareness.set_local(local);

        let connection = ConnectionManager::new(transport, document_id.clone(), config.reconnect);
        let status = connection.subscribe_state();
        let (commands, command_rx) = mpsc::channel(64);

        if let Some(reason) = degraded {
            let _ = events.send(SessionEvent::PersistenceDegraded { reason });
        }

        let handle = Self {
            document_id: document_id.clone(),
            user_id: config.user_id.clone(),
            site_id,
            commands,
            events: events.clone(),
            status,
            max_attempts: config.reconnect.max_attempts,
        };

        let actor = SessionActor {
            document_id,
            config,
            doc,
            awareness,
            connection,
            store,
            last_synced,
            abandoned: HashSet::new(),
            dirty: false,
            events,
            reported: ConnectionState::Disconnected,
        };
        tokio::spawn(actor.run(command_rx));

        handle
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Awareness client id of this session.
    pub fn client_id(&self) -> String {
        self.site_id.to_string()
    }

    /// Insert `text` at visible char `position`.
    pub async fn insert_text(&self, position: usize, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::Insert { position, text, reply }).await?
    }

    /// Delete `length` chars starting at `position`.
    pub async fn delete_text(&self, position: usize, length: usize) -> Result<(), SessionError> {
        self.request(|reply| Command::Delete {
            position,
            length,
            reply,
        })
        .await?
    }

    /// Replace the whole content with `text`, turning the difference into
    /// edits. `cursor_hint` is where the user's caret was.
    pub async fn apply_text(&self, text: impl Into<String>, cursor_hint: usize) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::ApplyText {
            text,
            cursor_hint,
            reply,
        })
        .await?
    }

    /// Patch the local presence and broadcast it. Returns the new state.
    pub async fn update_awareness(&self, patch: AwarenessPatch) -> Result<AwarenessState, SessionError> {
        self.request(|reply| Command::UpdateAwareness { patch, reply })
            .await?
            .ok_or(SessionError::Closed)
    }

    pub async fn content(&self) -> Result<String, SessionError> {
        self.request(|reply| Command::Content { reply }).await
    }

    /// Everyone currently present, this session included.
    pub async fn active_users(&self) -> Result<Vec<AwarenessState>, SessionError> {
        self.request(|reply| Command::ActiveUsers { reply }).await
    }

    pub async fn state_vector(&self) -> Result<StateVector, SessionError> {
        self.request(|reply| Command::StateVector { reply }).await
    }

    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until the connection reaches `target`.
    ///
    /// Fails with [`SessionError::GaveUp`] once reconnecting has stopped,
    /// or [`SessionError::Closed`] when the session ends first.
    pub async fn wait_for_status(&self, target: ConnectionState) -> Result<(), SessionError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| *s == target || *s == ConnectionState::GaveUp)
            .await
            .map(|s| *s)
            .map_err(|_| SessionError::Closed)?;

        if reached == target {
            Ok(())
        } else {
            Err(SessionError::GaveUp {
                attempts: self.max_attempts + 1,
            })
        }
    }

    /// Wait for the first completed handshake.
    pub async fn wait_synced(&self) -> Result<(), SessionError> {
        self.wait_for_status(ConnectionState::Synced).await
    }

    /// Say goodbye, cancel timers, flush storage. Idempotent.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}

impl std::fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("document_id", &self.document_id)
            .field("user_id", &self.user_id)
            .field("site_id", &self.site_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Owns all mutable state of a session; lives on its own task.
struct SessionActor {
    document_id: String,
    config: SessionConfig,
    doc: Document,
    awareness: AwarenessRegistry,
    connection: ConnectionManager,
    /// `None` once storage has failed (or was never configured).
    store: Option<Arc<dyn Persistence>>,
    /// What the relay is known to hold: its last reported state vector plus
    /// every op received from it.
    last_synced: StateVector,
    /// Ops that already expired once in the causal buffer and triggered a
    /// resync. A second expiry drops them without another resync.
    abandoned: HashSet<OpId>,
    /// Remote changes not yet saved.
    dirty: bool,
    events: broadcast::Sender<SessionEvent>,
    reported: ConnectionState,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.connect().await;
        self.publish_status();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        maintenance.tick().await;

        loop {
            let retry_at = self.connection.retry_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        log::debug!("All handles for document {} dropped", self.document_id);
                        self.shutdown().await;
                        return;
                    }
                },

                frame = self.connection.next_frame() => match frame {
                    Some(Ok(frame)) => self.handle_frame(&frame).await,
                    Some(Err(e)) => self.connection.on_closed(&e.to_string()),
                    None => self.connection.on_closed("relay closed the link"),
                },

                _ = sleep_until_deadline(retry_at) => self.connect().await,

                _ = heartbeat.tick() => self.heartbeat().await,

                _ = maintenance.tick() => self.maintain().await,
            }

            self.publish_status();
        }
    }

    // ─── Local side ───────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Insert { position, text, reply } => {
                let result = self.doc.local_insert(position, &text).map_err(SessionError::from);
                let _ = reply.send(self.commit_local(result).await);
            }
            Command::Delete {
                position,
                length,
                reply,
            } => {
                let result = self.doc.local_delete(position, length).map_err(SessionError::from);
                let _ = reply.send(self.commit_local(result).await);
            }
            Command::ApplyText {
                text,
                cursor_hint,
                reply,
            } => {
                let result = self.apply_intents(&text, cursor_hint);
                let _ = reply.send(self.commit_local(result).await);
            }
            Command::UpdateAwareness { patch, reply } => {
                let state = self.awareness.patch_local(&patch, now_millis());
                if let Some(state) = &state {
                    self.send_awareness(state.clone()).await;
                    self.emit_awareness();
                }
                let _ = reply.send(state);
            }
            Command::Content { reply } => {
                let _ = reply.send(self.doc.content());
            }
            Command::ActiveUsers { reply } => {
                let _ = reply.send(self.awareness.snapshot());
            }
            Command::StateVector { reply } => {
                let _ = reply.send(self.doc.state_vector().clone());
            }
            // Handled by the run loop.
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn apply_intents(&mut self, text: &str, cursor_hint: usize) -> Result<Vec<Operation>, SessionError> {
        let intents = diff::diff(&self.doc.content(), text, cursor_hint);
        let mut ops = Vec::new();
        for intent in intents {
            match intent {
                EditIntent::Delete { position, length } => ops.extend(self.doc.local_delete(position, length)?),
                EditIntent::Insert { position, text } => ops.extend(self.doc.local_insert(position, &text)?),
            }
        }
        Ok(ops)
    }

    /// Persist, notify, and broadcast a batch of local ops.
    async fn commit_local(&mut self, result: Result<Vec<Operation>, SessionError>) -> Result<(), SessionError> {
        let ops = result?;
        if ops.is_empty() {
            return Ok(());
        }

        self.persist().await;
        self.emit(SessionEvent::ContentChanged {
            origin: ChangeOrigin::Local,
            content: self.doc.content(),
        });

        // Offline edits reach the relay in the next handshake.
        if self.connection.is_online() {
            let update = SyncMessage::update(self.document_id.clone(), ops);
            if let Err(e) = self.connection.send(&update).await {
                log::debug!("Update for {} deferred: {e}", self.document_id);
            }
        }
        Ok(())
    }

    // ─── Remote side ──────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: &str) {
        let msg = match SyncMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed frame for {}: {e}", self.document_id);
                self.request_resync(e.to_string()).await;
                return;
            }
        };
        if let Err(e) = msg.ensure_document(&self.document_id) {
            log::warn!("Dropping frame: {e}");
            self.request_resync(e.to_string()).await;
            return;
        }

        match msg.payload {
            Payload::SyncStep1 { state_vector } => {
                let missing = self.doc.ops_since(&state_vector);
                if !missing.is_empty() {
                    log::debug!("Pushing {} ops the relay lacks for {}", missing.len(), self.document_id);
                    let reply = SyncMessage::sync_step2(self.document_id.clone(), missing);
                    if self.connection.send(&reply).await.is_err() {
                        return;
                    }
                }
                // Pushed ops count as held only once the relay reports them.
                self.last_synced = state_vector;
                self.dirty = true;
            }
            Payload::SyncStep2 { ops } => {
                self.apply_remote_ops(ops);
                self.connection.mark_synced();
            }
            Payload::Update { ops } => self.apply_remote_ops(ops),
            Payload::AwarenessUpdate { client_id, state } => {
                if self.awareness.merge_remote(&client_id, state) {
                    log::trace!("Awareness from {client_id} on {}", self.document_id);
                    self.emit_awareness();
                }
            }
            Payload::Join { user_id } => {
                log::info!("{user_id} joined document {}", self.document_id);
                // Let the newcomer see us right away.
                if let Some(state) = self.awareness.touch_local(now_millis()) {
                    self.send_awareness(state).await;
                }
            }
            Payload::Leave { user_id, client_id } => {
                log::info!("{user_id} left document {}", self.document_id);
                let removed = match client_id {
                    Some(client_id) => self.awareness.remove_client(&client_id).is_some(),
                    None => !self.awareness.remove_user(&user_id).is_empty(),
                };
                if removed {
                    self.emit_awareness();
                }
            }
            Payload::Heartbeat => log::trace!("Heartbeat on {}", self.document_id),
        }
    }

    /// Apply ops that came from the relay.
    fn apply_remote_ops(&mut self, ops: Vec<Operation>) {
        for op in &ops {
            self.last_synced.observe(op.id());
        }
        let now = tokio::time::Instant::now().into_std();
        let applied: usize = ops
            .into_iter()
            .map(|op| self.doc.apply_remote_at(op, now).applied())
            .sum();
        if applied > 0 {
            self.dirty = true;
            self.emit(SessionEvent::ContentChanged {
                origin: ChangeOrigin::Remote,
                content: self.doc.content(),
            });
        }
    }

    // ─── Connection ───────────────────────────────────────────────────

    async fn connect(&mut self) {
        if self.connection.connect().await.is_ok() {
            self.handshake().await;
        }
    }

    /// Full handshake on every (re)connect. Ops the relay was never known
    /// to hold go out right away; the relay's own `syncStep1` covers
    /// anything else it lost.
    async fn handshake(&mut self) {
        let mut messages = vec![
            SyncMessage::join(self.document_id.clone(), self.config.user_id.clone()),
            SyncMessage::sync_step1(self.document_id.clone(), self.doc.state_vector().clone()),
        ];
        let unsynced = self.doc.ops_since(&self.last_synced);
        if !unsynced.is_empty() {
            log::debug!("Uploading {} unsynced ops for {}", unsynced.len(), self.document_id);
            messages.push(SyncMessage::sync_step2(self.document_id.clone(), unsynced));
        }
        if let Some(state) = self.awareness.touch_local(now_millis()) {
            messages.push(SyncMessage::awareness(self.document_id.clone(), state));
        }

        for msg in &messages {
            if let Err(e) = self.connection.send(msg).await {
                log::warn!("Handshake for {} interrupted: {e}", self.document_id);
                return;
            }
        }
    }

    async fn request_resync(&mut self, reason: String) {
        self.emit(SessionEvent::ResyncRequested { reason });
        if self.connection.is_online() {
            let step1 = SyncMessage::sync_step1(self.document_id.clone(), self.doc.state_vector().clone());
            let _ = self.connection.send(&step1).await;
        }
    }

    async fn send_awareness(&mut self, state: AwarenessState) {
        if self.connection.is_online() {
            let msg = SyncMessage::awareness(self.document_id.clone(), state);
            let _ = self.connection.send(&msg).await;
        }
    }

    // ─── Timers ───────────────────────────────────────────────────────

    async fn heartbeat(&mut self) {
        let Some(state) = self.awareness.touch_local(now_millis()) else {
            return;
        };
        if self.connection.is_online() {
            if self.connection.send(&SyncMessage::heartbeat(self.document_id.clone())).await.is_err() {
                return;
            }
            self.send_awareness(state).await;
        }
    }

    async fn maintain(&mut self) {
        if !self
            .awareness
            .purge_stale(now_millis(), self.config.awareness_ttl)
            .is_empty()
        {
            self.emit_awareness();
        }

        let now = tokio::time::Instant::now().into_std();
        let expired = self.doc.expire_pending(now, self.config.causal_gap_timeout);
        let vector = self.doc.state_vector();
        self.abandoned.retain(|id| !vector.contains(*id));
        if !expired.is_empty() {
            let repeated = expired.iter().all(|op| self.abandoned.contains(&op.id()));
            self.abandoned.extend(expired.iter().map(Operation::id));
            if repeated {
                log::warn!(
                    "{} ops for {} still miss their dependencies after a resync; dropping them",
                    expired.len(),
                    self.document_id
                );
            } else {
                log::warn!(
                    "{} ops for {} waited over {:?} for their dependencies; resyncing",
                    expired.len(),
                    self.document_id,
                    self.config.causal_gap_timeout
                );
                self.request_resync(format!("{} ops expired in the causal buffer", expired.len()))
                    .await;
            }
        }

        if self.dirty {
            self.persist().await;
        }
    }

    async fn shutdown(&mut self) {
        if self.connection.is_online() {
            let leave = SyncMessage::leave_client(
                self.document_id.clone(),
                self.config.user_id.clone(),
                self.awareness.local_client_id(),
            );
            if let Err(e) = self.connection.send(&leave).await {
                log::debug!("Leave for {} not delivered: {e}", self.document_id);
            }
        }
        self.connection.close().await;
        self.persist().await;
        log::info!("Session for document {} closed", self.document_id);
    }

    // ─── Persistence ──────────────────────────────────────────────────

    async fn persist(&mut self) {
        let Some(store) = self.store.clone() else {
            self.dirty = false;
            return;
        };

        let snapshot = PersistedSnapshot::from_document(self.document_id.clone(), &self.doc, &self.last_synced);
        match store.save(&snapshot).await {
            Ok(()) => self.dirty = false,
            Err(e) => {
                log::warn!(
                    "Persisting {} failed: {e}; continuing in memory only",
                    self.document_id
                );
                self.store = None;
                self.dirty = false;
                self.emit(SessionEvent::PersistenceDegraded { reason: e.to_string() });
            }
        }
    }

    // ─── Events ───────────────────────────────────────────────────────

    fn publish_status(&mut self) {
        let state = self.connection.state();
        if state == self.reported {
            return;
        }
        self.reported = state;
        self.emit(SessionEvent::StatusChanged(state));
        if state == ConnectionState::GaveUp {
            self.emit(SessionEvent::GaveUp {
                attempts: self.connection.failures(),
            });
        }
    }

    fn emit_awareness(&self) {
        self.emit(SessionEvent::AwarenessChanged {
            users: self.awareness.snapshot(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
