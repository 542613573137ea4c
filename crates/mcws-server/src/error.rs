use mcws_core::CoreError;
use thiserror::Error;

/// Errors produced by the listener side.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("websocket upgrade failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
