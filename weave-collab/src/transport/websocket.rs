use async_trait::async_trait;
use futures_util::{future, stream, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use super::{FrameSink, FrameStream, Link, Transport, TransportError};

/// WebSocket client transport.
///
/// Connects to `<base_url>/<documentId>` and exchanges JSON text frames.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    base_url: String,
}

impl WebSocketTransport {
    /// `base_url` is the relay endpoint, e.g. `ws://127.0.0.1:9090`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, document_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), document_id)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, document_id: &str) -> Result<Link, TransportError> {
        let url = self.url_for(document_id);
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{url}: {e}")))?;
        log::debug!("WebSocket connected to {url}");
        Ok(websocket_link(ws))
    }
}

/// Wrap an established WebSocket (client or server side) as a text-frame link.
///
/// Binary frames are accepted if they hold UTF-8; ping/pong frames are
/// handled by tungstenite and skipped here. A close frame ends the stream.
pub(crate) fn websocket_link<S>(ws: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws.split();

    let sink: FrameSink = Box::pin(
        write
            .with(|frame: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(frame.into()))))
            .sink_map_err(|e| TransportError::SendFailed(e.to_string())),
    );

    let stream: FrameStream = Box::pin(stream::unfold(read, |mut read| async move {
        loop {
            match read.next().await {
                None | Some(Ok(Message::Close(_))) => return None,
                Some(Ok(Message::Text(text))) => return Some((Ok(text.as_str().to_owned()), read)),
                Some(Ok(Message::Binary(data))) => {
                    let frame = String::from_utf8(data.to_vec())
                        .map_err(|e| TransportError::ReceiveFailed(e.to_string()));
                    return Some((frame, read));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some((Err(TransportError::ReceiveFailed(e.to_string())), read)),
            }
        }
    }));

    Link::new(sink, stream)
}
