//! Message-oriented transport under a duplex channel.

use crate::error::{ConciergeError, Result};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::info;
use url::Url;

/// Outgoing text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConciergeError> + Send>>;
/// Incoming text frames. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open connection.
pub struct TransportLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens connections for a duplex channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection to `url`.
    async fn connect(&self, url: &Url) -> Result<TransportLink>;
}

/// WebSocket transport via `tokio-tungstenite`. Text frames only.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<TransportLink> {
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| {
                ConciergeError::Transport(format!("connect {} failed: {e}", redact(url)))
            })?;
        info!("websocket connected: {}", redact(url));

        let (write, read) = stream.split();

        let sink = write
            .with(|text: String| {
                futures_util::future::ready(Ok::<_, tungstenite::Error>(Message::Text(text)))
            })
            .sink_map_err(|e| ConciergeError::Transport(e.to_string()));

        let stream = read.filter_map(|frame| {
            futures_util::future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                // Binary frames are not part of either protocol; control
                // frames are answered by tungstenite.
                Ok(_) => None,
                Err(e) => Some(Err(ConciergeError::Transport(e.to_string()))),
            })
        });

        Ok(TransportLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Build `base + path?session_id=...`.
///
/// # Errors
///
/// Returns [`ConciergeError::Config`] if `base` or `path` is not a valid URL.
pub fn endpoint_url(base: &str, path: &str, session_id: &str) -> Result<Url> {
    let base = Url::parse(base).map_err(|e| ConciergeError::Config(format!("base url: {e}")))?;
    let mut url = base
        .join(path)
        .map_err(|e| ConciergeError::Config(format!("endpoint path: {e}")))?;
    url.query_pairs_mut().append_pair("session_id", session_id);
    Ok(url)
}

/// URL without its query string, for logs.
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn endpoint_url_joins_path_and_session() {
        let url = endpoint_url("wss://api.example.com", "/ws/audio", "abc 1").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.example.com/ws/audio?session_id=abc+1"
        );
    }

    #[test]
    fn endpoint_url_rejects_garbage_base() {
        assert!(matches!(
            endpoint_url("not a url", "/ws/chat", "s"),
            Err(ConciergeError::Config(_))
        ));
    }

    #[test]
    fn redact_drops_query() {
        let url = endpoint_url("ws://localhost:8000", "/ws/chat", "secret").unwrap();
        assert_eq!(redact(&url), "ws://localhost:8000/ws/chat");
    }

    #[tokio::test]
    async fn connect_failure_does_not_leak_session_id() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let url = endpoint_url(&format!("ws://{addr}"), "/ws/audio", "session_private").unwrap();

        let Err(err) = WebSocketTransport.connect(&url).await else {
            panic!("nothing is listening on {addr}");
        };
        let message = err.to_string();
        assert!(matches!(err, ConciergeError::Transport(_)));
        assert!(message.contains("/ws/audio"), "{message}");
        assert!(!message.contains("session_private"), "{message}");
    }
}
