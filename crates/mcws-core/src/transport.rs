//! Abstract message transport for mcws sessions.
//!
//! The protocol assumes a transport that delivers and accepts whole
//! messages (a WebSocket in production). The in-memory implementation
//! backs tests and same-process wiring.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One whole transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Plaintext JSON.
    Text(String),
    /// Ciphertext (or any opaque payload).
    Binary(Vec<u8>),
    /// Close signal; transports translate it into their own teardown.
    Close,
}

impl WireMessage {
    /// The payload bytes, if this is a payload-bearing message.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            WireMessage::Text(s) => Some(s.into_bytes()),
            WireMessage::Binary(b) => Some(b),
            WireMessage::Close => None,
        }
    }
}

/// A whole-message bidirectional transport.
#[async_trait]
pub trait MessageTransport: Send {
    /// Send one message.
    async fn send(&mut self, msg: WireMessage) -> CoreResult<()>;

    /// Receive the next message. `None` means the peer is gone.
    async fn recv(&mut self) -> Option<CoreResult<WireMessage>>;

    /// Close the transport.
    async fn close(&mut self) -> CoreResult<()>;
}

/// In-memory transport over unbounded channels.
pub struct MemoryTransport {
    to_peer: mpsc::UnboundedSender<WireMessage>,
    from_peer: mpsc::UnboundedReceiver<WireMessage>,
}

impl MemoryTransport {
    /// A connected pair; frames sent on one side arrive on the other.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                to_peer: a_tx,
                from_peer: b_rx,
            },
            MemoryTransport {
                to_peer: b_tx,
                from_peer: a_rx,
            },
        )
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn send(&mut self, msg: WireMessage) -> CoreResult<()> {
        self.to_peer.send(msg).map_err(|_| CoreError::Closed)
    }

    async fn recv(&mut self) -> Option<CoreResult<WireMessage>> {
        match self.from_peer.recv().await {
            None | Some(WireMessage::Close) => None,
            Some(msg) => Some(Ok(msg)),
        }
    }

    async fn close(&mut self) -> CoreResult<()> {
        let _ = self.to_peer.send(WireMessage::Close);
        Ok(())
    }
}
