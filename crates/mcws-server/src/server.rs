//! The WebSocket listener: accepts game connections and produces sessions.

use crate::error::ServerError;
use crate::handshake;
use crate::session::{ServerHandle, ServerSession};
use crate::transport::WsTransport;
use mcws_core::messages::CommandLine;
use mcws_core::session::HandlerOutcome;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

/// Listens for the game's `/connect <host>:<port>`.
pub struct WsServer {
    listener: TcpListener,
    sessions: Arc<Mutex<Vec<ServerHandle>>>,
}

/// One accepted connection.
pub struct IncomingClient {
    pub session: ServerSession,
    pub peer_addr: SocketAddr,
    /// Request path from the upgrade (the game sends `/`).
    pub path: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WsServer {
    /// Bind the listener.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<WsServer, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "mcws server listening");
        Ok(WsServer {
            listener,
            sessions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next client. Failed upgrades are logged and skipped so a
    /// port scanner cannot stall the accept loop.
    pub async fn accept(&self) -> Result<IncomingClient, ServerError> {
        loop {
            let (mut stream, peer_addr) = self.listener.accept().await?;
            match handshake::upgrade(&mut stream).await {
                Ok(request) => {
                    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
                    let session = ServerSession::new(WsTransport::new(ws))?;
                    {
                        let mut sessions = lock(&self.sessions);
                        sessions.retain(|handle| !handle.is_closed());
                        sessions.push(session.handle().clone());
                    }
                    info!(%peer_addr, path = %request.path, "client connected");
                    return Ok(IncomingClient {
                        session,
                        peer_addr,
                        path: request.path,
                    });
                }
                Err(e) => {
                    warn!(%peer_addr, error = %e, "websocket upgrade rejected");
                }
            }
        }
    }

    fn live_sessions(&self) -> Vec<ServerHandle> {
        let mut sessions = lock(&self.sessions);
        sessions.retain(|handle| !handle.is_closed());
        sessions.clone()
    }

    /// Issue a command on every live session, discarding responses.
    pub fn broadcast_command(&self, line: impl Into<CommandLine>) {
        let line = line.into();
        for session in self.live_sessions() {
            let _ = session.send_command(line.clone(), |_| HandlerOutcome::Consume);
        }
    }

    /// Send a bare subscribe on every live session.
    pub fn broadcast_subscribe(&self, event_name: &str) {
        for session in self.live_sessions() {
            let _ = session.subscribe_raw(event_name);
        }
    }

    /// Send a bare unsubscribe on every live session.
    pub fn broadcast_unsubscribe(&self, event_name: &str) {
        for session in self.live_sessions() {
            let _ = session.unsubscribe_raw(event_name);
        }
    }

    /// Disconnect every live session.
    pub fn disconnect_all(&self, force: bool) {
        for session in self.live_sessions() {
            let _ = session.disconnect(force);
        }
    }

    /// Tear the listener down, force-closing every session.
    pub fn close(self) {
        self.disconnect_all(true);
        lock(&self.sessions).clear();
    }
}
