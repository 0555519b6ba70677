//! Transport port: how a session reaches the relay.
//!
//! A transport hands out a [`Link`], a pair of text-frame sink and stream
//! for one document. The session never sees sockets; swapping WebSocket
//! for an in-process channel (tests, embedding) is a constructor change.
//!
//! Implementations:
//! - [`WebSocketTransport`]: `ws://host:port/<documentId>`, text frames
//! - [`MemoryTransport`]   : in-process link straight into a [`SyncServer`]
//!
//! [`SyncServer`]: crate::server::SyncServer

mod memory;
mod websocket;

pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;
pub(crate) use websocket::websocket_link;

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Link closed")]
    Closed,
}

/// Outgoing half of a link.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Incoming half of a link. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One bidirectional connection carrying JSON text frames.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens links to the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the relay for `document_id`.
    async fn connect(&self, document_id: &str) -> Result<Link, TransportError>;
}
