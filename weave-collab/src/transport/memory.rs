use async_trait::async_trait;
use futures_util::{sink, stream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use super::{FrameSink, FrameStream, Link, Transport, TransportError};
use crate::server::SyncServer;

/// In-process transport wired straight into a [`SyncServer`].
///
/// Each `connect` spawns the server side of the link on the current
/// runtime. Failures can be injected to exercise reconnect logic without
/// sockets.
pub struct MemoryTransport {
    server: Arc<SyncServer>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
    /// Kill switches for the links handed out so far.
    links: Mutex<Vec<watch::Sender<bool>>>,
}

impl MemoryTransport {
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            fail_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Total connect attempts, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Drop every open link, as if the network went away. Returns how many
    /// links were severed.
    pub fn sever_all(&self) -> usize {
        let switches: Vec<watch::Sender<bool>> = {
            let mut links = self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            links.drain(..).collect()
        };
        let count = switches.len();
        for switch in switches {
            let _ = switch.send(true);
        }
        log::debug!("Severed {count} memory links");
        count
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, document_id: &str) -> Result<Link, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::ConnectionFailed(format!(
                "injected failure on attempt {attempt}"
            )));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel::<String>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<String>();
        let (kill_tx, kill_rx) = watch::channel(false);
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(kill_tx);

        let server_side = Link::new(channel_sink(server_tx), severable_stream(server_rx, kill_rx.clone()));
        let label = format!("memory:{document_id}#{attempt}");
        tokio::spawn(self.server.clone().serve_link(server_side, label));

        Ok(Link::new(channel_sink(client_tx), severable_stream(client_rx, kill_rx)))
    }
}

fn channel_sink(tx: mpsc::UnboundedSender<String>) -> FrameSink {
    Box::pin(sink::unfold(tx, |tx, frame: String| async move {
        tx.send(frame).map_err(|_| TransportError::Closed)?;
        Ok::<_, TransportError>(tx)
    }))
}

/// Stream that ends when the peer hangs up or the kill switch flips.
fn severable_stream(rx: mpsc::UnboundedReceiver<String>, kill: watch::Receiver<bool>) -> FrameStream {
    Box::pin(stream::unfold((rx, kill), |(mut rx, mut kill)| async move {
        if *kill.borrow() {
            return None;
        }
        tokio::select! {
            frame = rx.recv() => frame.map(|frame| (Ok(frame), (rx, kill))),
            _ = kill.changed() => None,
        }
    }))
}
