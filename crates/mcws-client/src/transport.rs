//! WebSocket transport adapter for client-side sessions.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mcws_core::{CoreError, CoreResult, MessageTransport, WireMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Bridges a tungstenite WebSocket to the mcws message transport.
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> MessageTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: WireMessage) -> CoreResult<()> {
        let msg = match msg {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(bytes) => Message::Binary(bytes),
            WireMessage::Close => Message::Close(None),
        };
        self.inner
            .send(msg)
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<CoreResult<WireMessage>> {
        loop {
            return match self.inner.next().await? {
                Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
                Ok(Message::Binary(bytes)) => Some(Ok(WireMessage::Binary(bytes))),
                Ok(Message::Ping(payload)) => {
                    let _ = self.inner.send(Message::Pong(payload)).await;
                    continue;
                }
                Ok(Message::Close(_)) => {
                    debug!("server sent close frame");
                    None
                }
                Ok(_) => continue,
                Err(e) => Some(Err(CoreError::Transport(e.to_string()))),
            };
        }
    }

    async fn close(&mut self) -> CoreResult<()> {
        self.inner
            .close(None)
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))
    }
}
