use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the mcws protocol layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("encryption handshake already in progress")]
    EncryptionPending,

    #[error("encryption already enabled")]
    EncryptionActive,

    #[error("responder already registered for request {0}")]
    DuplicateResponder(Uuid),

    #[error("handler already registered for purpose {0}")]
    DuplicateHandler(String),

    #[error("command failed ({status_code}): {status_message}")]
    CommandFailed {
        status_code: i64,
        status_message: String,
    },

    #[error("session closed")]
    Closed,

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Codec(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
