//! Session engine: correlation tables, frame dispatch, and the transport
//! driver loop.
//!
//! Each session owns one transport, driven by a single spawned task. Every
//! inbound frame is resolved through three ordered lookups: the pending
//! responder table (by `requestId`), the purpose handler table (by
//! `messagePurpose`), and finally the fallback channel. Responders and
//! handlers run synchronously on the driver task and must not block.

use crate::codec::WireCodec;
use crate::crypto::{CipherPair, EncryptionMode, KeyExchangeOffer};
use crate::error::{CoreError, CoreResult};
use crate::frame::{ExtraHeaders, Frame};
use crate::purpose::Purpose;
use crate::transport::{MessageTransport, WireMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// What a responder or handler did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Done; remove the registration.
    Consume,
    /// More frames on this key are still expected.
    Keep,
}

/// A boxed responder/handler. Runs on the driver task; errors are surfaced
/// as session error events without unwinding the dispatch loop.
pub type FrameFn = Box<dyn FnMut(&SessionHandle, &Frame) -> CoreResult<HandlerOutcome> + Send>;

/// Engine-level events the roles translate for their consumers.
#[derive(Debug)]
pub enum EngineEvent {
    /// Fell through both dispatch tables.
    Unhandled(Frame),
    Error(CoreError),
    Disconnected,
}

struct Tables {
    responders: Mutex<HashMap<Uuid, FrameFn>>,
    handlers: Mutex<HashMap<Purpose, FrameFn>>,
}

/// Cloneable send/registration surface of one session.
///
/// All clones share the dispatch tables, the wire codec (and with it the
/// encryption state), and the session version.
#[derive(Clone)]
pub struct SessionHandle {
    outgoing: mpsc::UnboundedSender<WireMessage>,
    codec: Arc<Mutex<WireCodec>>,
    tables: Arc<Tables>,
    version: Arc<AtomicU32>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Create a handle plus the outgoing queue consumed by the driver.
    pub fn new(initial_version: u32) -> (SessionHandle, mpsc::UnboundedReceiver<WireMessage>) {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            outgoing,
            codec: Arc::new(Mutex::new(WireCodec::new())),
            tables: Arc::new(Tables {
                responders: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
            }),
            version: Arc::new(AtomicU32::new(initial_version)),
        };
        (handle, outgoing_rx)
    }

    /// The session's current protocol version.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
    }

    /// Ratchet the version upward when the peer advertises a higher one.
    pub fn observe_version(&self, version: u32) {
        self.version.fetch_max(version, Ordering::AcqRel);
    }

    /// Send a pre-built envelope (still encrypted when active).
    pub fn send(&self, frame: &Frame) -> CoreResult<()> {
        let msg = lock(&self.codec).encode(frame)?;
        self.outgoing.send(msg).map_err(|_| CoreError::Closed)
    }

    /// Build and send a frame. A missing `request_id` becomes the sentinel.
    pub fn send_frame(
        &self,
        purpose: Purpose,
        body: Value,
        request_id: Option<Uuid>,
        extra: ExtraHeaders,
    ) -> CoreResult<Uuid> {
        let id = request_id.unwrap_or_else(Uuid::nil);
        let mut frame = Frame::response(self.version(), purpose, id, body);
        frame.extra = extra;
        self.send(&frame)?;
        Ok(id)
    }

    /// Ask the driver to close the transport.
    pub fn close(&self) {
        let _ = self.outgoing.send(WireMessage::Close);
    }

    /// Whether the driver is gone (socket closed or session dropped).
    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }

    // ── Correlation API ─────────────────────────────────────────────────

    /// Register a responder for a request id. Registering a second one on
    /// the same id is a programming error.
    pub fn set_responder(&self, request_id: Uuid, responder: FrameFn) -> CoreResult<()> {
        match lock(&self.tables.responders).entry(request_id) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(CoreError::DuplicateResponder(request_id))
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(responder);
                Ok(())
            }
        }
    }

    /// Remove a responder; returns whether one was registered.
    pub fn clear_responder(&self, request_id: Uuid) -> bool {
        lock(&self.tables.responders).remove(&request_id).is_some()
    }

    /// Register a purpose handler. One handler per purpose.
    pub fn set_handler(&self, purpose: Purpose, handler: FrameFn) -> CoreResult<()> {
        match lock(&self.tables.handlers).entry(purpose) {
            std::collections::hash_map::Entry::Occupied(slot) => {
                Err(CoreError::DuplicateHandler(slot.key().as_str().into_owned()))
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Remove a purpose handler; returns whether one was registered.
    pub fn clear_handler(&self, purpose: &Purpose) -> bool {
        lock(&self.tables.handlers).remove(purpose).is_some()
    }

    // ── Encryption state (delegated to the codec) ───────────────────────

    pub fn begin_key_exchange(&self, mode: EncryptionMode) -> CoreResult<KeyExchangeOffer> {
        lock(&self.codec).begin_key_exchange(mode)
    }

    pub fn complete_key_exchange(&self, peer_public_b64: &str) -> CoreResult<()> {
        lock(&self.codec).complete_key_exchange(peer_public_b64)
    }

    pub fn respond_key_exchange(
        &self,
        mode: EncryptionMode,
        peer_public_b64: &str,
        salt_b64: &str,
    ) -> CoreResult<(String, CipherPair)> {
        lock(&self.codec).respond_key_exchange(mode, peer_public_b64, salt_b64)
    }

    pub fn activate_encryption(&self, pair: CipherPair) {
        lock(&self.codec).activate(pair);
    }

    pub fn is_encrypted(&self) -> bool {
        lock(&self.codec).is_encrypted()
    }

    pub fn encryption_engaged(&self) -> bool {
        lock(&self.codec).encryption_engaged()
    }

    fn decode(&self, msg: WireMessage) -> CoreResult<Frame> {
        lock(&self.codec).decode(msg)
    }
}

/// Resolve one inbound frame through the three-step dispatch.
pub fn dispatch(handle: &SessionHandle, frame: Frame, on_event: &mut (dyn FnMut(EngineEvent) + Send)) {
    handle.observe_version(frame.version);
    trace!(purpose = %frame.purpose, request_id = %frame.request_id, "inbound frame");

    // The entry is taken out for the duration of the call so a responder
    // can re-register (or clear) entries without deadlocking on the table.
    let responder = lock(&handle.tables.responders).remove(&frame.request_id);
    if let Some(mut responder) = responder {
        match responder(handle, &frame) {
            Ok(HandlerOutcome::Consume) => {}
            Ok(HandlerOutcome::Keep) => {
                lock(&handle.tables.responders)
                    .entry(frame.request_id)
                    .or_insert(responder);
            }
            Err(e) => {
                lock(&handle.tables.responders)
                    .entry(frame.request_id)
                    .or_insert(responder);
                on_event(EngineEvent::Error(e));
            }
        }
        return;
    }

    let handler = lock(&handle.tables.handlers).remove(&frame.purpose);
    if let Some(mut handler) = handler {
        let purpose = frame.purpose.clone();
        match handler(handle, &frame) {
            Ok(HandlerOutcome::Consume) => {}
            Ok(HandlerOutcome::Keep) => {
                lock(&handle.tables.handlers)
                    .entry(purpose)
                    .or_insert(handler);
            }
            Err(e) => {
                lock(&handle.tables.handlers)
                    .entry(purpose)
                    .or_insert(handler);
                on_event(EngineEvent::Error(e));
            }
        }
        return;
    }

    on_event(EngineEvent::Unhandled(frame));
}

/// Spawn the driver task for a session.
pub fn spawn_driver<T>(
    transport: T,
    handle: SessionHandle,
    outgoing_rx: mpsc::UnboundedReceiver<WireMessage>,
    on_event: impl FnMut(EngineEvent) + Send + 'static,
) -> JoinHandle<()>
where
    T: MessageTransport + 'static,
{
    tokio::spawn(drive(transport, handle, outgoing_rx, Box::new(on_event)))
}

/// The per-session driver loop: pumps the outgoing queue into the
/// transport and dispatches inbound frames.
pub async fn drive<T: MessageTransport>(
    mut transport: T,
    handle: SessionHandle,
    mut outgoing_rx: mpsc::UnboundedReceiver<WireMessage>,
    mut on_event: Box<dyn FnMut(EngineEvent) + Send>,
) {
    loop {
        tokio::select! {
            outbound = outgoing_rx.recv() => match outbound {
                Some(WireMessage::Close) | None => {
                    let _ = transport.close().await;
                    break;
                }
                Some(msg) => {
                    if let Err(e) = transport.send(msg).await {
                        on_event(EngineEvent::Error(e));
                        break;
                    }
                }
            },
            inbound = transport.recv() => match inbound {
                Some(Ok(msg)) => match handle.decode(msg) {
                    Ok(frame) => dispatch(&handle, frame, on_event.as_mut()),
                    Err(e) => {
                        // Malformed frame: report and keep the session alive.
                        warn!(error = %e, "discarding undecodable frame");
                        on_event(EngineEvent::Error(e));
                    }
                },
                Some(Err(e)) => {
                    on_event(EngineEvent::Error(e));
                    break;
                }
                None => break,
            }
        }
    }

    debug!("session driver ended");
    // Outstanding responders are dropped without invocation; clearing the
    // tables also breaks the handle cycle held by handler closures.
    lock(&handle.tables.responders).clear();
    lock(&handle.tables.handlers).clear();
    on_event(EngineEvent::Disconnected);
}
