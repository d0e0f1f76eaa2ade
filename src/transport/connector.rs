//! Connector seam between the session manager and the actual socket layer.
//!
//! A [`Connector`] opens one bidirectional text-frame stream authenticated by
//! nothing but the local identity string. Framing and TLS belong to the
//! socket layer underneath.

use crate::utils::{ChatError, Result, TransportError};
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// Handshake header carrying the local identity
pub const IDENTITY_HEADER: &str = "X-User-Id";

/// Event read from an open stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// One text frame
    Text(String),
    /// The remote closed the stream gracefully
    Closed,
}

/// Outbound half of a connection
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChatError> + Send>>;

/// Inbound half of a connection; ends with `None` on abrupt loss
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<InboundFrame>> + Send>>;

/// An open bidirectional stream
pub struct Connection {
    /// Frames written here go to the relay
    pub sink: FrameSink,
    /// Frames from the relay
    pub stream: FrameStream,
}

/// Opens the single logical connection for an identity
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a stream announcing `identity` in the handshake
    async fn connect(&self, identity: &str) -> Result<Connection>;

    /// Human-readable remote endpoint, for logs
    fn endpoint(&self) -> &str;
}

/// WebSocket connector for `ws://` and `wss://` relays
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: String,
}

impl WebSocketConnector {
    /// Create a connector for `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn connection_failed(&self, reason: impl ToString) -> ChatError {
        TransportError::ConnectionFailed {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
        .into()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, identity: &str) -> Result<Connection> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| self.connection_failed(e))?;
        let header = HeaderValue::from_str(identity).map_err(|e| self.connection_failed(e))?;
        request.headers_mut().insert(IDENTITY_HEADER, header);

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| self.connection_failed(e))?;
        log::debug!("WebSocket handshake with {} complete", self.endpoint);

        let (sink, stream) = socket.split();

        let sink = sink.with(|text: String| future::ready(Ok::<_, ChatError>(Message::Text(text))));

        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text))),
                Ok(Message::Binary(bytes)) => Some(Ok(InboundFrame::Text(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))),
                Ok(Message::Close(_)) => Some(Ok(InboundFrame::Closed)),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(e) => Some(Err(ChatError::from(e))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
