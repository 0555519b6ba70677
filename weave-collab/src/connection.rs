//! Connection lifecycle with exponential backoff.
//!
//! ```text
//!               connect()                 link ok
//! Disconnected ──────────► Connecting ───────────► Connected ──► Synced
//!      ▲                       │                       │           │
//!      │   retry timer fires   │ fail                  │ drop      │ drop
//!      └───────────────────────┴───────────────────────┴───────────┘
//!                              │
//!                              │ failure #(max_attempts + 1)
//!                              ▼
//!                            GaveUp
//! ```
//!
//! The manager owns the current [`Link`] and a single retry deadline. It
//! never sleeps itself: the session loop selects on [`retry_deadline`]
//! and calls [`connect`] when it fires, so dropping the session cancels
//! the timer.
//!
//! [`retry_deadline`]: ConnectionManager::retry_deadline
//! [`connect`]: ConnectionManager::connect

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::protocol::SyncMessage;
use crate::transport::{FrameSink, FrameStream, Transport, TransportError};

/// Connection state as observed by the session and the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected and the initial state exchange completed.
    Synced,
    /// Reconnect attempts exhausted. Local editing continues.
    GaveUp,
}

impl ConnectionState {
    /// Whether a link is up (synced or not).
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Synced)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Synced => "synced",
            ConnectionState::GaveUp => "gave-up",
        };
        f.write_str(name)
    }
}

/// Exponential backoff: `base_delay * 2^(failures - 1)` for failures
/// `1..=max_attempts`, then give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures,
    /// or `None` when it is time to give up.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_attempts {
            return None;
        }
        Some(self.base_delay.saturating_mul(2u32.saturating_pow(failures - 1)))
    }
}

/// Owns the link to the relay for one document.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    document_id: String,
    policy: ReconnectPolicy,
    state: ConnectionState,
    /// Consecutive failures since the last completed handshake. A link the
    /// relay drops before syncing counts as a failure too.
    failures: u32,
    retry_at: Option<Instant>,
    sink: Option<FrameSink>,
    stream: Option<FrameStream>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, document_id: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            document_id: document_id.into(),
            policy,
            state: ConnectionState::Disconnected,
            failures: 0,
            retry_at: None,
            sink: None,
            stream: None,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Watch channel mirroring every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// When the pending reconnect should run, if one is scheduled.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    /// Try to open a link. On failure a retry is scheduled, or the manager
    /// moves to [`ConnectionState::GaveUp`] when attempts are exhausted.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.state == ConnectionState::GaveUp {
            return Err(TransportError::Closed);
        }
        self.retry_at = None;
        self.set_state(ConnectionState::Connecting);

        match self.transport.connect(&self.document_id).await {
            Ok(link) => {
                self.sink = Some(link.sink);
                self.stream = Some(link.stream);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                log::warn!("Connect to document {} failed: {e}", self.document_id);
                self.record_failure();
                Err(e)
            }
        }
    }

    /// The link dropped (stream ended, read or write error).
    pub fn on_closed(&mut self, reason: &str) {
        if !self.state.is_online() {
            return;
        }
        log::warn!("Link for document {} lost: {reason}", self.document_id);
        self.sink = None;
        self.stream = None;
        self.record_failure();
    }

    /// Handshake finished: the first SyncStep2 arrived. Only now does the
    /// failure streak end.
    pub fn mark_synced(&mut self) {
        if self.state == ConnectionState::Connected {
            self.failures = 0;
            self.set_state(ConnectionState::Synced);
        }
    }

    /// Send one message. A failed write counts as a dropped link.
    pub async fn send(&mut self, msg: &SyncMessage) -> Result<(), TransportError> {
        let frame = msg
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let sink = self.sink.as_mut().ok_or(TransportError::Closed)?;

        let sent = sink.send(frame).await;
        if let Err(e) = sent {
            self.on_closed(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Next incoming frame. Pends forever while there is no link, which
    /// lets the caller use it unconditionally inside `select!`.
    ///
    /// `None` means the link ended; the caller reports it via [`on_closed`].
    ///
    /// [`on_closed`]: ConnectionManager::on_closed
    pub async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => std::future::pending().await,
        }
    }

    /// Close the link and cancel any scheduled retry.
    pub async fn close(&mut self) {
        self.retry_at = None;
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                log::debug!("Closing link for document {}: {e}", self.document_id);
            }
        }
        if self.state != ConnectionState::GaveUp {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        match self.policy.delay_for(self.failures) {
            Some(delay) => {
                log::info!(
                    "Retrying document {} in {delay:?} (failure {}/{})",
                    self.document_id,
                    self.failures,
                    self.policy.max_attempts
                );
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Disconnected);
            }
            None => {
                log::error!(
                    "Giving up on document {} after {} consecutive failures",
                    self.document_id,
                    self.failures
                );
                self.retry_at = None;
                self.set_state(ConnectionState::GaveUp);
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            log::info!("Document {}: {} -> {}", self.document_id, self.state, next);
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ServerConfig, SyncServer};
    use crate::transport::MemoryTransport;

    fn manager(transport: Arc<MemoryTransport>) -> ConnectionManager {
        ConnectionManager::new(transport, "doc", ReconnectPolicy::default())
    }

    #[test]
    fn test_policy_delays_double() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<Option<Duration>> = (0..=6).map(|f| policy.delay_for(f)).collect();
        assert_eq!(
            delays,
            vec![
                None,
                Some(Duration::from_millis(1000)),
                Some(Duration::from_millis(2000)),
                Some(Duration::from_millis(4000)),
                Some(Duration::from_millis(8000)),
                Some(Duration::from_millis(16000)),
                None,
            ]
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::GaveUp.to_string(), "gave-up");
        assert!(ConnectionState::Synced.is_online());
        assert!(!ConnectionState::Connecting.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_schedules_retry() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = Arc::new(MemoryTransport::new(server));
        transport.fail_next_connects(1);
        let mut conn = manager(transport.clone());

        let before = Instant::now();
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.failures(), 1);
        let deadline = conn.retry_deadline().unwrap();
        assert_eq!(deadline.duration_since(before), Duration::from_millis(1000));

        assert!(conn.connect().await.is_ok());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.retry_deadline().is_none());

        // The streak only ends with a completed handshake.
        assert_eq!(conn.failures(), 1);
        conn.mark_synced();
        assert_eq!(conn.state(), ConnectionState::Synced);
        assert_eq!(conn.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = Arc::new(MemoryTransport::new(server));
        transport.fail_next_connects(100);
        let mut conn = manager(transport.clone());
        let mut states = conn.subscribe_state();

        for _ in 0..6 {
            let _ = conn.connect().await;
        }
        assert_eq!(conn.state(), ConnectionState::GaveUp);
        assert_eq!(*states.borrow_and_update(), ConnectionState::GaveUp);
        assert!(conn.retry_deadline().is_none());

        // No further attempts once given up.
        assert_eq!(conn.connect().await, Err(TransportError::Closed));
        assert_eq!(transport.connect_attempts(), 6);
    }

    #[tokio::test]
    async fn test_link_drop_counts_as_failure() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = Arc::new(MemoryTransport::new(server));
        let mut conn = manager(transport.clone());

        conn.connect().await.unwrap();
        conn.send(&SyncMessage::join("doc", "alice")).await.unwrap();
        transport.sever_all();

        assert!(conn.next_frame().await.is_none());
        conn.on_closed("stream ended");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.failures(), 1);
        assert!(conn.retry_deadline().is_some());
        assert_eq!(
            conn.send(&SyncMessage::heartbeat("doc")).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_links_dropped_before_sync_exhaust_retries() {
        let config = ServerConfig {
            max_peers_per_room: 1,
            ..ServerConfig::for_testing()
        };
        let server = Arc::new(SyncServer::new(config));
        let transport = Arc::new(MemoryTransport::new(server));
        let mut occupant = transport.connect("doc").await.unwrap();
        occupant
            .sink
            .send(SyncMessage::join("doc", "alice").encode().unwrap())
            .await
            .unwrap();

        let mut conn = manager(transport.clone());
        for attempt in 1..=6 {
            conn.connect().await.unwrap();
            conn.send(&SyncMessage::join("doc", "bob")).await.unwrap();
            // The relay refuses the join and hangs up.
            assert!(conn.next_frame().await.is_none());
            conn.on_closed("relay closed the link");
            assert_eq!(conn.failures(), attempt);
        }

        assert_eq!(conn.state(), ConnectionState::GaveUp);
        assert!(conn.retry_deadline().is_none());
        assert_eq!(transport.connect_attempts(), 7);
    }

    #[tokio::test]
    async fn test_close_cancels_retry() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = Arc::new(MemoryTransport::new(server));
        transport.fail_next_connects(1);
        let mut conn = manager(transport);

        let _ = conn.connect().await;
        assert!(conn.retry_deadline().is_some());
        conn.close().await;
        assert!(conn.retry_deadline().is_none());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
