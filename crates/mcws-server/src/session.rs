//! The driver-side session role.
//!
//! `ServerSession` wraps the core session engine with the operations the
//! driver issues against the game: commands (current, legacy, agent),
//! event subscriptions with first/last-listener frame elision, filtered
//! chat subscriptions, catalog data requests, the encryption handshake in
//! both dialects, and graceful or forced disconnect.

use mcws_core::error::{CoreError, CoreResult};
use mcws_core::frame::{ExtraHeaders, Frame};
use mcws_core::messages::{
    ChatSubscribeBody, ChatUnsubscribeBody, CommandLine, CommandOrigin, CommandRequestBody,
    ErrorBody, LegacyCommandRequestBody,
};
use mcws_core::purpose::Purpose;
use mcws_core::session::{spawn_driver, EngineEvent, HandlerOutcome, SessionHandle};
use mcws_core::transport::MessageTransport;
use mcws_core::version::{ProtocolVersion, DEFAULT_COMMAND_VERSION};
use mcws_core::EncryptionMode;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Listener invoked for every matching `event` frame.
pub type EventListener = Box<dyn FnMut(&EventFrame) + Send>;

/// Identifies one registered event listener.
pub type ListenerId = u64;

/// An `event` frame enriched with its resolved event name.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub name: String,
    pub frame: Frame,
}

/// A `chat` frame with the filter fields lifted out of the body.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub chat_message: Option<String>,
    pub chat_type: Option<String>,
    pub frame: Frame,
}

impl ChatMessage {
    fn lift(frame: &Frame) -> ChatMessage {
        let field = |key: &str| {
            frame
                .body
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        ChatMessage {
            sender: field("sender"),
            receiver: field("receiver"),
            chat_message: field("message"),
            chat_type: field("type"),
            frame: frame.clone(),
        }
    }
}

/// Events delivered to the session's consumer.
#[derive(Debug)]
pub enum ServerEvent {
    /// An `event` frame that no registered listener matched.
    Event(EventFrame),
    /// An inbound `error` purpose frame from the game.
    ClientError {
        status_code: i64,
        status_message: String,
        request_id: Uuid,
    },
    /// Fell through both dispatch tables.
    CustomFrame(Frame),
    EncryptionEnabled,
    Error(CoreError),
    Disconnected,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event listeners, keyed by name then listener id.
///
/// Membership is tracked separately from closure storage: during dispatch
/// the closures are temporarily taken out of `storage` (so a listener may
/// subscribe or unsubscribe without deadlocking), while `members` stays
/// authoritative for first/last accounting.
#[derive(Default)]
struct SubscriptionTable {
    next_id: ListenerId,
    storage: HashMap<String, BTreeMap<ListenerId, EventListener>>,
    members: HashMap<String, HashSet<ListenerId>>,
}

impl SubscriptionTable {
    /// Returns `(listener_id, was_first_for_name)`.
    fn add(&mut self, name: &str, listener: EventListener) -> (ListenerId, bool) {
        let id = self.next_id;
        self.next_id += 1;
        let members = self.members.entry(name.to_string()).or_default();
        members.insert(id);
        let first = members.len() == 1;
        self.storage
            .entry(name.to_string())
            .or_default()
            .insert(id, listener);
        (id, first)
    }

    /// Returns `(was_registered, was_last_for_name)`.
    fn remove(&mut self, name: &str, id: ListenerId) -> (bool, bool) {
        let Some(members) = self.members.get_mut(name) else {
            return (false, false);
        };
        if !members.remove(&id) {
            return (false, false);
        }
        let last = members.is_empty();
        if last {
            self.members.remove(name);
        }
        if let Some(storage) = self.storage.get_mut(name) {
            storage.remove(&id);
            if storage.is_empty() && last {
                self.storage.remove(name);
            }
        }
        (true, last)
    }

    fn take(&mut self, name: &str) -> Option<BTreeMap<ListenerId, EventListener>> {
        self.storage.get_mut(name).map(mem::take)
    }

    /// Put taken listeners back, dropping any that were unsubscribed while
    /// they were out.
    fn restore(&mut self, name: &str, taken: BTreeMap<ListenerId, EventListener>) {
        let Some(members) = self.members.get(name) else {
            return;
        };
        let storage = self.storage.entry(name.to_string()).or_default();
        for (id, listener) in taken {
            if members.contains(&id) {
                storage.entry(id).or_insert(listener);
            }
        }
    }

    fn clear(&mut self) {
        self.storage.clear();
        self.members.clear();
    }
}

pub(crate) struct ServerShared {
    subscriptions: Mutex<SubscriptionTable>,
    chat_subscriptions: Mutex<HashSet<Uuid>>,
    pub(crate) pending: Mutex<HashMap<Uuid, oneshot::Sender<CoreResult<Frame>>>>,
    command_version: AtomicU32,
}

impl Default for ServerShared {
    fn default() -> Self {
        ServerShared {
            subscriptions: Mutex::new(SubscriptionTable::default()),
            chat_subscriptions: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            command_version: AtomicU32::new(DEFAULT_COMMAND_VERSION),
        }
    }
}

fn reject_pending(
    shared: &ServerShared,
    session: &SessionHandle,
    mut make_err: impl FnMut() -> CoreError,
) {
    let drained: Vec<_> = lock(&shared.pending).drain().collect();
    for (id, tx) in drained {
        session.clear_responder(id);
        let _ = tx.send(Err(make_err()));
    }
}

/// Cloneable operations surface of a driver-side session.
#[derive(Clone)]
pub struct ServerHandle {
    pub(crate) session: SessionHandle,
    pub(crate) shared: Arc<ServerShared>,
    pub(crate) events_tx: mpsc::UnboundedSender<ServerEvent>,
}

/// One accepted game connection, driver side.
///
/// Dereferences to [`ServerHandle`] for all operations; dropping the
/// session closes the connection.
pub struct ServerSession {
    handle: ServerHandle,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl ServerSession {
    /// Wrap a transport and spawn the session driver.
    pub fn new(transport: impl MessageTransport + 'static) -> CoreResult<ServerSession> {
        let (session, outgoing_rx) = SessionHandle::new(ProtocolVersion::MIN.as_u32());
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared::default());

        // Listener dispatch for `event` frames.
        {
            let shared = shared.clone();
            let events_tx = events_tx.clone();
            session.set_handler(
                Purpose::Event,
                Box::new(move |_session, frame| {
                    dispatch_event(&shared, &events_tx, frame);
                    Ok(HandlerOutcome::Keep)
                }),
            )?;
        }

        // Inbound `error` frames reject every awaited request, then surface.
        {
            let shared = shared.clone();
            let events_tx = events_tx.clone();
            session.set_handler(
                Purpose::Error,
                Box::new(move |session, frame| {
                    let body: ErrorBody =
                        serde_json::from_value(frame.body.clone()).unwrap_or_default();
                    reject_pending(&shared, session, || CoreError::CommandFailed {
                        status_code: body.status_code,
                        status_message: body.status_message.clone(),
                    });
                    let _ = events_tx.send(ServerEvent::ClientError {
                        status_code: body.status_code,
                        status_message: body.status_message,
                        request_id: frame.request_id,
                    });
                    Ok(HandlerOutcome::Keep)
                }),
            )?;
        }

        let handle = ServerHandle {
            session: session.clone(),
            shared: shared.clone(),
            events_tx: events_tx.clone(),
        };

        let driver_session = session.clone();
        spawn_driver(
            transport,
            session,
            outgoing_rx,
            move |event| match event {
                EngineEvent::Unhandled(frame) => {
                    let _ = events_tx.send(ServerEvent::CustomFrame(frame));
                }
                EngineEvent::Error(e) => {
                    let detail = e.to_string();
                    reject_pending(&shared, &driver_session, || {
                        CoreError::Transport(format!("session error: {detail}"))
                    });
                    let _ = events_tx.send(ServerEvent::Error(e));
                }
                EngineEvent::Disconnected => {
                    reject_pending(&shared, &driver_session, || CoreError::Closed);
                    lock(&shared.subscriptions).clear();
                    let _ = events_tx.send(ServerEvent::Disconnected);
                }
            },
        );

        Ok(ServerSession { handle, events })
    }

    /// Receive the next session event. `None` after disconnect once the
    /// queue drains.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// A cloneable handle for issuing operations elsewhere (broadcasts,
    /// background tasks).
    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }
}

impl std::ops::Deref for ServerSession {
    type Target = ServerHandle;

    fn deref(&self) -> &ServerHandle {
        &self.handle
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.handle.session.close();
    }
}

fn dispatch_event(
    shared: &ServerShared,
    events_tx: &mpsc::UnboundedSender<ServerEvent>,
    frame: &Frame,
) {
    let name = frame.event_name().to_string();
    let taken = lock(&shared.subscriptions).take(&name);
    match taken {
        Some(mut listeners) if !listeners.is_empty() => {
            let event = EventFrame {
                name: name.clone(),
                frame: frame.clone(),
            };
            // The set was copied out above, so listeners may subscribe or
            // unsubscribe freely while we iterate.
            for listener in listeners.values_mut() {
                listener(&event);
            }
            lock(&shared.subscriptions).restore(&name, listeners);
        }
        Some(empty) => {
            lock(&shared.subscriptions).restore(&name, empty);
            let _ = events_tx.send(ServerEvent::Event(EventFrame {
                name,
                frame: frame.clone(),
            }));
        }
        None => {
            let _ = events_tx.send(ServerEvent::Event(EventFrame {
                name,
                frame: frame.clone(),
            }));
        }
    }
}

impl ServerHandle {
    /// The underlying session engine handle.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Current protocol version of this session.
    pub fn version(&self) -> u32 {
        self.session.version()
    }

    /// Command semantics version stamped into command request bodies.
    pub fn command_version(&self) -> u32 {
        self.shared.command_version.load(Ordering::Relaxed)
    }

    pub fn set_command_version(&self, version: u32) {
        self.shared.command_version.store(version, Ordering::Relaxed);
    }

    /// Whether the driver task has ended.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Send a pre-built envelope, bypassing the typed operations.
    pub fn send(&self, frame: &Frame) -> CoreResult<()> {
        self.session.send(frame)
    }

    pub(crate) fn command_frame(&self, line: CommandLine) -> CoreResult<Frame> {
        let body = CommandRequestBody {
            version: self.command_version(),
            command_line: line.into_line(),
            origin: CommandOrigin::default(),
        };
        Ok(Frame::request(
            self.session.version(),
            Purpose::CommandRequest,
            serde_json::to_value(body)?,
        ))
    }

    pub(crate) fn legacy_command_frame(
        &self,
        name: &str,
        overload: &str,
        input: Value,
    ) -> CoreResult<Frame> {
        let body = LegacyCommandRequestBody {
            version: self.command_version(),
            name: name.to_string(),
            overload: overload.to_string(),
            input,
            origin: CommandOrigin::default(),
        };
        Ok(Frame::request(
            self.session.version(),
            Purpose::CommandRequest,
            serde_json::to_value(body)?,
        ))
    }

    fn send_with_responder(
        &self,
        frame: Frame,
        mut responder: impl FnMut(&Frame) -> HandlerOutcome + Send + 'static,
    ) -> CoreResult<Uuid> {
        let id = frame.request_id;
        self.session
            .set_responder(id, Box::new(move |_session, frame| Ok(responder(frame))))?;
        if let Err(e) = self.session.send(&frame) {
            self.session.clear_responder(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Issue a command; the responder receives the `commandResponse`.
    pub fn send_command(
        &self,
        line: impl Into<CommandLine>,
        responder: impl FnMut(&Frame) -> HandlerOutcome + Send + 'static,
    ) -> CoreResult<Uuid> {
        let frame = self.command_frame(line.into())?;
        self.send_with_responder(frame, responder)
    }

    /// Issue a legacy-shape command (`{name, overload, input}`).
    pub fn send_command_legacy(
        &self,
        name: &str,
        overload: &str,
        input: Value,
        responder: impl FnMut(&Frame) -> HandlerOutcome + Send + 'static,
    ) -> CoreResult<Uuid> {
        let frame = self.legacy_command_frame(name, overload, input)?;
        self.send_with_responder(frame, responder)
    }

    /// Issue an agent (NPC) command over the `action:agent` purpose.
    pub fn send_agent_command(
        &self,
        line: impl Into<CommandLine>,
        responder: impl FnMut(&Frame) -> HandlerOutcome + Send + 'static,
    ) -> CoreResult<Uuid> {
        let body = CommandRequestBody {
            version: self.command_version(),
            command_line: line.into().into_line(),
            origin: CommandOrigin::default(),
        };
        let frame = Frame::request(
            self.session.version(),
            Purpose::AgentAction,
            serde_json::to_value(body)?,
        );
        self.send_with_responder(frame, responder)
    }

    /// Send a bare `subscribe` frame, without listener bookkeeping.
    pub fn subscribe_raw(&self, event_name: &str) -> CoreResult<()> {
        self.session
            .send_frame(
                Purpose::Subscribe,
                serde_json::json!({ "eventName": event_name }),
                None,
                ExtraHeaders::default(),
            )
            .map(|_| ())
    }

    /// Send a bare `unsubscribe` frame, without listener bookkeeping.
    pub fn unsubscribe_raw(&self, event_name: &str) -> CoreResult<()> {
        self.session
            .send_frame(
                Purpose::Unsubscribe,
                serde_json::json!({ "eventName": event_name }),
                None,
                ExtraHeaders::default(),
            )
            .map(|_| ())
    }

    /// Register an event listener. The `subscribe` frame goes out only for
    /// the first listener on a name.
    pub fn subscribe(
        &self,
        event_name: &str,
        listener: impl FnMut(&EventFrame) + Send + 'static,
    ) -> CoreResult<ListenerId> {
        let (id, first) = lock(&self.shared.subscriptions).add(event_name, Box::new(listener));
        if first {
            if let Err(e) = self.subscribe_raw(event_name) {
                lock(&self.shared.subscriptions).remove(event_name, id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Remove an event listener. The `unsubscribe` frame goes out only
    /// when the last listener on a name is removed. Returns whether the
    /// listener was registered.
    pub fn unsubscribe(&self, event_name: &str, listener: ListenerId) -> CoreResult<bool> {
        let (removed, last) = lock(&self.shared.subscriptions).remove(event_name, listener);
        if removed && last {
            self.unsubscribe_raw(event_name)?;
        }
        Ok(removed)
    }

    /// Subscribe to chat with optional filters (null matches anything).
    /// Returns the subscription's request id, used for unsubscribing.
    pub fn subscribe_chat(
        &self,
        sender: Option<String>,
        receiver: Option<String>,
        message: Option<String>,
        mut listener: impl FnMut(&ChatMessage) + Send + 'static,
    ) -> CoreResult<Uuid> {
        let body = ChatSubscribeBody {
            sender,
            receiver,
            message,
        };
        let frame = Frame::request(
            self.session.version(),
            Purpose::ChatSubscribe,
            serde_json::to_value(body)?,
        );
        let id = frame.request_id;
        // Chat responders stay resident until explicitly removed.
        self.session.set_responder(
            id,
            Box::new(move |_session, frame| {
                listener(&ChatMessage::lift(frame));
                Ok(HandlerOutcome::Keep)
            }),
        )?;
        lock(&self.shared.chat_subscriptions).insert(id);
        if let Err(e) = self.session.send(&frame) {
            self.session.clear_responder(id);
            lock(&self.shared.chat_subscriptions).remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Tear down a single chat subscription by its request id.
    pub fn unsubscribe_chat(&self, subscription: Uuid) -> CoreResult<bool> {
        if !lock(&self.shared.chat_subscriptions).remove(&subscription) {
            return Ok(false);
        }
        self.session.clear_responder(subscription);
        let body = ChatUnsubscribeBody {
            request_id: Some(subscription),
        };
        self.session.send_frame(
            Purpose::ChatUnsubscribe,
            serde_json::to_value(body)?,
            None,
            ExtraHeaders::default(),
        )?;
        Ok(true)
    }

    /// Tear down every chat subscription with a single empty-bodied
    /// `chat:unsubscribe`.
    pub fn unsubscribe_chat_all(&self) -> CoreResult<()> {
        let drained: Vec<Uuid> = lock(&self.shared.chat_subscriptions).drain().collect();
        for id in drained {
            self.session.clear_responder(id);
        }
        let body = ChatUnsubscribeBody { request_id: None };
        self.session.send_frame(
            Purpose::ChatUnsubscribe,
            serde_json::to_value(body)?,
            None,
            ExtraHeaders::default(),
        )?;
        Ok(())
    }

    /// Request bulk catalog data (`block`, `item`, `mob`, or any name the
    /// game answers).
    pub fn fetch_data(
        &self,
        data_type: &str,
        responder: impl FnMut(&Frame) -> HandlerOutcome + Send + 'static,
    ) -> CoreResult<Uuid> {
        let frame = Frame::request(
            self.session.version(),
            Purpose::data_request(data_type),
            Value::Null,
        );
        self.send_with_responder(frame, responder)
    }

    /// Start the encryption handshake in the dialect matching the
    /// session's version. Returns `Ok(false)` without side effects when a
    /// handshake is already pending or complete; `on_done` fires once the
    /// peer's response has been processed.
    pub fn enable_encryption_with(
        &self,
        mode: Option<EncryptionMode>,
        on_done: impl FnOnce(CoreResult<()>) + Send + 'static,
    ) -> CoreResult<bool> {
        let mode = mode.unwrap_or_default();
        let offer = match self.session.begin_key_exchange(mode) {
            Ok(offer) => offer,
            Err(CoreError::EncryptionPending | CoreError::EncryptionActive) => return Ok(false),
            Err(e) => return Err(e),
        };

        let version = self.session.version();
        let frame = if version >= ProtocolVersion::V1_0_0.as_u32() {
            let body = mcws_core::messages::EncryptRequestBody {
                mode: mode.wire_name().to_string(),
                public_key: offer.public_key,
                salt: offer.salt,
            };
            Frame::request(version, Purpose::Encrypt, serde_json::to_value(body)?)
        } else {
            // Pre-1.0.0 games take the handshake as a synthetic command.
            let line = format!(
                "enableencryption {} {} {}",
                serde_json::to_string(&offer.public_key)?,
                serde_json::to_string(&offer.salt)?,
                serde_json::to_string(mode.wire_name())?,
            );
            let body = CommandRequestBody {
                version: self.command_version(),
                command_line: line,
                origin: CommandOrigin::default(),
            };
            Frame::request(version, Purpose::CommandRequest, serde_json::to_value(body)?)
        };

        let id = frame.request_id;
        let events_tx = self.events_tx.clone();
        let mut on_done = Some(on_done);
        self.session.set_responder(
            id,
            Box::new(move |session, frame| {
                let peer_public = frame
                    .body
                    .get("publicKey")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let result = session.complete_key_exchange(peer_public);
                if result.is_ok() {
                    let _ = events_tx.send(ServerEvent::EncryptionEnabled);
                }
                if let Some(done) = on_done.take() {
                    done(result);
                }
                Ok(HandlerOutcome::Consume)
            }),
        )?;
        if let Err(e) = self.session.send(&frame) {
            self.session.clear_responder(id);
            return Err(e);
        }
        Ok(true)
    }

    /// Awaitable handshake: resolves `true` once encryption is active,
    /// `false` when a handshake was already pending or complete.
    pub async fn enable_encryption(&self, mode: Option<EncryptionMode>) -> CoreResult<bool> {
        let (tx, rx) = oneshot::channel();
        let started = self.enable_encryption_with(mode, move |result| {
            let _ = tx.send(result);
        })?;
        if !started {
            return Ok(false);
        }
        match rx.await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::Closed),
        }
    }

    /// Disconnect: forced closes the socket; graceful asks the game to
    /// close via the `closewebsocket` command.
    pub fn disconnect(&self, force: bool) -> CoreResult<()> {
        if force {
            self.session.close();
            Ok(())
        } else {
            self.send_command("closewebsocket", |_| HandlerOutcome::Consume)
                .map(|_| ())
        }
    }
}
