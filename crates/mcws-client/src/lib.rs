//! mcws-client: the game side of the mcws protocol.
//!
//! In this workspace the client role stands in for the game itself — it is
//! what protocol tests and tooling connect with. It answers command,
//! agent, chat and data requests, gates event publication on observed
//! subscriptions, and completes the encryption handshake in both dialects.

pub mod session;
pub mod transport;

pub use session::{
    AgentActionRequest, ChatSubscription, ClientConfig, ClientEvent, ClientHandle, ClientSession,
    CommandRequest, DataRequest, EncryptionRequest, LegacyCommandRequest,
};
pub use transport::WsTransport;
