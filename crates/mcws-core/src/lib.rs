//! mcws-core: Shared protocol library for the mcws toolkit.
//!
//! Provides the JSON frame envelope, protocol version and purpose tables,
//! the ECDH/AES-CFB encrypted channel, the encrypt-aware wire codec, the
//! session engine (request/purpose dispatch), and abstract message
//! transports.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod messages;
pub mod purpose;
pub mod session;
pub mod transport;
pub mod version;

// Re-export commonly used items at crate root.
pub use codec::WireCodec;
pub use crypto::{CipherPair, EncryptionMode, KeyExchangeOffer};
pub use error::{CoreError, CoreResult};
pub use frame::{ExtraHeaders, Frame};
pub use purpose::Purpose;
pub use session::{EngineEvent, HandlerOutcome, SessionHandle};
pub use transport::{MemoryTransport, MessageTransport, WireMessage};
pub use version::{ProtocolVersion, DEFAULT_COMMAND_VERSION};

/// The WebSocket subprotocol both endpoints must negotiate.
pub const SUBPROTOCOL: &str = "com.microsoft.minecraft.wsencrypt";
