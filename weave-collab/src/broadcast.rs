//! Fan-out of encoded frames to every connection in a document room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a receiver that falls further behind observes
//! `RecvError::Lagged` and must be resynced by its owner.
//!
//! Frames are tagged with the originating connection so the owner of a
//! receiver can skip its own echoes.
//!
//! Performance target: 1,000 frames to 100 peers < 10ms
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// A connection attached to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub connection_id: Uuid,
    pub user_id: String,
}

impl PeerInfo {
    pub fn new(connection_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
        }
    }
}

/// One encoded frame plus the connection it came from.
#[derive(Debug, Clone)]
pub struct Fanout {
    pub origin: Uuid,
    pub frame: Arc<str>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path, read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Fanout>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames each receiver may buffer before it
    /// starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Fanout> {
        let mut peers = self.peers.write().await;
        peers.insert(info.connection_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(connection_id)
    }

    /// Encode `msg` once and fan it out. Returns the number of receivers.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = msg.encode()?.into();
        Ok(self.broadcast_raw(origin, frame))
    }

    /// Fan out an already encoded frame.
    pub fn broadcast_raw(&self, origin: Uuid, frame: Arc<str>) -> usize {
        // No receivers is not an error for a room.
        let count = self.sender.send(Fanout { origin, frame }).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `missed` frames.
    pub fn record_lag(&self, missed: u64) {
        self.atomic_stats.messages_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
