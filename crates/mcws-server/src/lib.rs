//! mcws-server: the driver side of the mcws protocol.
//!
//! A [`WsServer`] listens for the game's `/connect` and yields one
//! [`ServerSession`] per accepted socket. The session issues commands,
//! subscribes to events and chat, requests catalog data, drives agents,
//! and can upgrade the connection to the encrypted channel. The awaitable
//! facade on [`ServerHandle`] wraps the callback API in futures with
//! cancellation and timeout.

pub mod error;
pub mod facade;
pub mod handshake;
pub mod server;
pub mod session;
pub mod transport;

pub use error::ServerError;
pub use facade::PendingRequest;
pub use server::{IncomingClient, WsServer};
pub use session::{ChatMessage, EventFrame, ListenerId, ServerEvent, ServerHandle, ServerSession};
pub use transport::WsTransport;
