//! The game-side session role.
//!
//! Each inbound request purpose surfaces as a [`ClientEvent`] carrying a
//! context bound to the request's id, with `respond` methods instead of
//! raw frame plumbing. Event publication is gated per event name on
//! observed subscribe/unsubscribe frames.

use crate::transport::WsTransport;
use mcws_core::error::{CoreError, CoreResult};
use mcws_core::frame::Frame;
use mcws_core::messages::{ChatUnsubscribeBody, EncryptResponseBody, ErrorBody};
use mcws_core::purpose::Purpose;
use mcws_core::session::{spawn_driver, EngineEvent, HandlerOutcome, SessionHandle};
use mcws_core::transport::MessageTransport;
use mcws_core::version::ProtocolVersion;
use mcws_core::{EncryptionMode, SUBPROTOCOL};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use uuid::Uuid;

/// Connection settings for the client role.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Protocol version this client advertises in its frames.
    pub version: ProtocolVersion,
    /// Connect timeout for [`ClientSession::connect`].
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            version: ProtocolVersion::MIN,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Events delivered to the client application.
#[derive(Debug)]
pub enum ClientEvent {
    Command(CommandRequest),
    CommandLegacy(LegacyCommandRequest),
    AgentAction(AgentActionRequest),
    /// A subscription gate flipped off → on for this event name.
    Subscribe { event_name: String },
    /// A subscription gate flipped on → off for this event name.
    Unsubscribe { event_name: String },
    ChatSubscribe(ChatSubscription),
    ChatUnsubscribe { request_id: Option<Uuid> },
    /// A `ws:encrypt` request; accept it or cancel it.
    EncryptRequest(EncryptionRequest),
    /// An inbound `error` purpose frame from the peer.
    PeerError {
        status_code: i64,
        status_message: String,
        request_id: Uuid,
    },
    CustomFrame(Frame),
    EncryptionEnabled,
    Error(CoreError),
    Disconnected,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ClientShared {
    /// Per-event publish gate: true only between an observed subscribe and
    /// the matching unsubscribe.
    gates: Mutex<HashMap<String, bool>>,
}

/// A `commandRequest` carrying the current command-line shape.
#[derive(Debug)]
pub struct CommandRequest {
    session: SessionHandle,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    pub request_id: Uuid,
    pub command_line: String,
    pub frame: Frame,
}

impl CommandRequest {
    /// Send the `commandResponse` for this request.
    pub fn respond(&self, body: Value) -> CoreResult<()> {
        self.session.send(&Frame::response(
            self.session.version(),
            Purpose::CommandResponse,
            self.request_id,
            body,
        ))
    }

    /// Send an `error` purpose response for this request.
    pub fn respond_error(&self, status_code: i64, status_message: &str) -> CoreResult<()> {
        let body = ErrorBody {
            status_code,
            status_message: status_message.to_string(),
        };
        self.session.send(&Frame::response(
            self.session.version(),
            Purpose::Error,
            self.request_id,
            serde_json::to_value(body)?,
        ))
    }

    /// Detect and complete the legacy `enableencryption` handshake.
    ///
    /// Returns `Ok(false)` when this command is not the handshake, so the
    /// application can respond normally. On the handshake: derives the
    /// session key, sends the command response with our public key, then
    /// activates the ciphers — every later outbound byte is ciphertext.
    pub fn handle_encryption_handshake(&self) -> CoreResult<bool> {
        let Some(args) = self.command_line.strip_prefix("enableencryption ") else {
            return Ok(false);
        };
        let (peer_public, salt, mode) = parse_handshake_args(args)?;
        let (public_key, pair) = self.session.respond_key_exchange(mode, &peer_public, &salt)?;
        self.respond(serde_json::json!({ "publicKey": public_key, "statusCode": 0 }))?;
        self.session.activate_encryption(pair);
        let _ = self.events_tx.send(ClientEvent::EncryptionEnabled);
        Ok(true)
    }
}

/// Arguments of the legacy handshake command: two JSON string literals and
/// an optional mode (`cfb8` when absent).
fn parse_handshake_args(args: &str) -> CoreResult<(String, String, EncryptionMode)> {
    let mut tokens = args.split_whitespace();
    let peer_public = json_string_arg(tokens.next())?;
    let salt = json_string_arg(tokens.next())?;
    let mode = match tokens.next() {
        None => EncryptionMode::default(),
        Some(token) => {
            let name =
                serde_json::from_str::<String>(token).unwrap_or_else(|_| token.to_string());
            EncryptionMode::parse(&name)
                .ok_or_else(|| CoreError::Crypto(format!("unknown cipher mode {name}")))?
        }
    };
    Ok((peer_public, salt, mode))
}

fn json_string_arg(token: Option<&str>) -> CoreResult<String> {
    let token =
        token.ok_or_else(|| CoreError::Codec("enableencryption: missing argument".into()))?;
    Ok(serde_json::from_str::<String>(token).unwrap_or_else(|_| token.to_string()))
}

/// A `commandRequest` carrying the legacy `{name, overload, input}` shape.
#[derive(Debug)]
pub struct LegacyCommandRequest {
    session: SessionHandle,
    pub request_id: Uuid,
    pub name: String,
    pub overload: String,
    pub input: Value,
    pub frame: Frame,
}

impl LegacyCommandRequest {
    pub fn respond(&self, body: Value) -> CoreResult<()> {
        self.session.send(&Frame::response(
            self.session.version(),
            Purpose::CommandResponse,
            self.request_id,
            body,
        ))
    }

    /// Legacy-shaped commands never carry the handshake.
    pub fn handle_encryption_handshake(&self) -> CoreResult<bool> {
        Ok(false)
    }
}

/// An `action:agent` request.
#[derive(Debug)]
pub struct AgentActionRequest {
    session: SessionHandle,
    pub request_id: Uuid,
    pub command_line: String,
    pub frame: Frame,
}

impl AgentActionRequest {
    /// Answer on the command-response channel.
    pub fn respond_command(&self, body: Value) -> CoreResult<()> {
        self.session.send(&Frame::response(
            self.session.version(),
            Purpose::CommandResponse,
            self.request_id,
            body,
        ))
    }

    /// Answer on the agent channel with `{action, actionName}` headers.
    pub fn respond_agent_action(
        &self,
        action: Value,
        action_name: &str,
        body: Value,
    ) -> CoreResult<()> {
        let frame = Frame::response(
            self.session.version(),
            Purpose::AgentAction,
            self.request_id,
            body,
        )
        .with_agent_action(action, action_name);
        self.session.send(&frame)
    }
}

/// A `chat:subscribe` request; the id doubles as the subscription handle
/// the driver side will unsubscribe with.
#[derive(Debug, Clone)]
pub struct ChatSubscription {
    pub request_id: Uuid,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub message: Option<String>,
}

/// A `data:<kind>` request handed to a registered data responder.
#[derive(Debug)]
pub struct DataRequest {
    session: SessionHandle,
    pub request_id: Uuid,
    pub data_type: String,
}

impl DataRequest {
    /// Send the `data` response; its header carries `{dataType, type: 0}`.
    pub fn respond(&self, body: Value) -> CoreResult<()> {
        let frame = Frame::response(
            self.session.version(),
            Purpose::Data,
            self.request_id,
            body,
        )
        .with_data_type(&self.data_type, 0);
        self.session.send(&frame)
    }
}

/// A V2 (`ws:encrypt`) handshake request. Consuming methods enforce that
/// the request is answered or cancelled at most once.
#[derive(Debug)]
pub struct EncryptionRequest {
    session: SessionHandle,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    pub request_id: Uuid,
    pub mode: String,
    pub public_key: String,
    pub salt: String,
}

impl EncryptionRequest {
    /// Derive the session key, send our public key back, and activate the
    /// ciphers.
    pub fn accept(self) -> CoreResult<()> {
        let mode = if self.mode.is_empty() {
            EncryptionMode::default()
        } else {
            EncryptionMode::parse(&self.mode)
                .ok_or_else(|| CoreError::Crypto(format!("unknown cipher mode {}", self.mode)))?
        };
        let (public_key, pair) =
            self.session
                .respond_key_exchange(mode, &self.public_key, &self.salt)?;
        let body = EncryptResponseBody { public_key };
        self.session.send(&Frame::response(
            self.session.version(),
            Purpose::Encrypt,
            self.request_id,
            serde_json::to_value(body)?,
        ))?;
        self.session.activate_encryption(pair);
        let _ = self.events_tx.send(ClientEvent::EncryptionEnabled);
        Ok(())
    }

    /// Decline the handshake; the request is dropped unanswered.
    pub fn cancel(self) {}
}

/// Cloneable operations surface of a game-side session.
#[derive(Clone)]
pub struct ClientHandle {
    session: SessionHandle,
    shared: Arc<ClientShared>,
}

/// One connection to a driver, game side.
///
/// Dereferences to [`ClientHandle`]; dropping the session closes the
/// connection.
pub struct ClientSession {
    handle: ClientHandle,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientSession {
    /// Wrap a transport and spawn the session driver.
    pub fn new(
        transport: impl MessageTransport + 'static,
        config: ClientConfig,
    ) -> CoreResult<ClientSession> {
        let (session, outgoing_rx) = SessionHandle::new(config.version.as_u32());
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared::default());

        register_request_handlers(&session, &shared, &events_tx)?;

        let handle = ClientHandle {
            session: session.clone(),
            shared,
        };
        let driver_events = events_tx;
        spawn_driver(transport, session, outgoing_rx, move |event| {
            let mapped = match event {
                EngineEvent::Unhandled(frame) => ClientEvent::CustomFrame(frame),
                EngineEvent::Error(e) => ClientEvent::Error(e),
                EngineEvent::Disconnected => ClientEvent::Disconnected,
            };
            let _ = driver_events.send(mapped);
        });

        Ok(ClientSession { handle, events })
    }

    /// Dial a driver and negotiate the required subprotocol.
    pub async fn connect(addr: &str, config: ClientConfig) -> CoreResult<ClientSession> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CoreError::Timeout)??;
        let mut request = format!("ws://{addr}/")
            .into_client_request()
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        let (ws, _response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        ClientSession::new(WsTransport::new(ws), config)
    }

    /// Receive the next session event.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }
}

impl std::ops::Deref for ClientSession {
    type Target = ClientHandle;

    fn deref(&self) -> &ClientHandle {
        &self.handle
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.handle.session.close();
    }
}

fn register_request_handlers(
    session: &SessionHandle,
    shared: &Arc<ClientShared>,
    events_tx: &mpsc::UnboundedSender<ClientEvent>,
) -> CoreResult<()> {
    {
        let tx = events_tx.clone();
        session.set_handler(
            Purpose::CommandRequest,
            Box::new(move |session, frame| {
                let event = if let Some(line) =
                    frame.body.get("commandLine").and_then(Value::as_str)
                {
                    ClientEvent::Command(CommandRequest {
                        session: session.clone(),
                        events_tx: tx.clone(),
                        request_id: frame.request_id,
                        command_line: line.to_string(),
                        frame: frame.clone(),
                    })
                } else if frame.body.get("name").is_some() {
                    ClientEvent::CommandLegacy(LegacyCommandRequest {
                        session: session.clone(),
                        request_id: frame.request_id,
                        name: string_field(&frame.body, "name"),
                        overload: string_field(&frame.body, "overload"),
                        input: frame.body.get("input").cloned().unwrap_or(Value::Null),
                        frame: frame.clone(),
                    })
                } else {
                    ClientEvent::CustomFrame(frame.clone())
                };
                let _ = tx.send(event);
                Ok(HandlerOutcome::Keep)
            }),
        )?;
    }

    {
        let tx = events_tx.clone();
        session.set_handler(
            Purpose::AgentAction,
            Box::new(move |session, frame| {
                let _ = tx.send(ClientEvent::AgentAction(AgentActionRequest {
                    session: session.clone(),
                    request_id: frame.request_id,
                    command_line: string_field(&frame.body, "commandLine"),
                    frame: frame.clone(),
                }));
                Ok(HandlerOutcome::Keep)
            }),
        )?;
    }

    {
        let tx = events_tx.clone();
        let gates = shared.clone();
        session.set_handler(
            Purpose::Subscribe,
            Box::new(move |_session, frame| {
                let name = frame.event_name().to_string();
                let mut table = lock(&gates.gates);
                let gate = table.entry(name.clone()).or_insert(false);
                if !*gate {
                    *gate = true;
                    drop(table);
                    let _ = tx.send(ClientEvent::Subscribe { event_name: name });
                }
                Ok(HandlerOutcome::Keep)
            }),
        )?;
    }

    {
        let tx = events_tx.clone();
        let gates = shared.clone();
        session.set_handler(
            Purpose::Unsubscribe,
            Box::new(move |_session, frame| {
                let name = frame.event_name().to_string();
                let mut table = lock(&gates.gates);
                let gate = table.entry(name.clone()).or_insert(false);
                if *gate {
                    *gate = false;
                    drop(table);
                    let _ = tx.send(ClientEvent::Unsubscribe { event_name: name });
                }
                Ok(HandlerOutcome::Keep)
            }),
        )?;
    }

    {
        let tx = events_tx.clone();
        session.set_handler(
            Purpose::ChatSubscribe,
            Box::new(move |_session, frame| {
                let field = |key: &str| {
                    frame
                        .body
                        .get(key)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                let _ = tx.send(ClientEvent::ChatSubscribe(ChatSubscription {
                    request_id: frame.request_id,
                    sender: field("sender"),
                    receiver: field("receiver"),
                    message: field("message"),
                }));
                Ok(HandlerOutcome::Keep)
            }),
        )?;
    }

    {
        let tx = events_tx.clone();
        session.set_handler(
            Purpose::ChatUnsubscribe,
            Box::new(move |_session, frame| {
                let body: ChatUnsubscribeBody =
                    serde_json::from_value(frame.body.clone()).unwrap_or_default();
                let _ = tx.send(ClientEvent::ChatUnsubscribe {
                    request_id: body.request_id,
                });
                Ok(HandlerOutcome::Keep)
            }),
        )?;
    }

    {
        let tx = events_tx.clone();
        session.set_handler(
            Purpose::Encrypt,
            Box::new(move |session, frame| {
                let _ = tx.send(ClientEvent::EncryptRequest(EncryptionRequest {
                    session: session.clone(),
                    events_tx: tx.clone(),
                    request_id: frame.request_id,
                    mode: string_field(&frame.body, "mode"),
                    public_key: string_field(&frame.body, "publicKey"),
                    salt: string_field(&frame.body, "salt"),
                }));
                Ok(HandlerOutcome::Keep)
            }),
        )?;
    }

    {
        let tx = events_tx.clone();
        session.set_handler(
            Purpose::Error,
            Box::new(move |_session, frame| {
                let body: ErrorBody =
                    serde_json::from_value(frame.body.clone()).unwrap_or_default();
                let _ = tx.send(ClientEvent::PeerError {
                    status_code: body.status_code,
                    status_message: body.status_message,
                    request_id: frame.request_id,
                });
                Ok(HandlerOutcome::Keep)
            }),
        )?;
    }

    Ok(())
}

fn string_field(body: &Value, key: &str) -> String {
    body.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl ClientHandle {
    /// The underlying session engine handle.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Current protocol version of this session.
    pub fn version(&self) -> u32 {
        self.session.version()
    }

    /// Whether the driver task has ended.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Send a pre-built envelope, bypassing the typed operations.
    pub fn send(&self, frame: &Frame) -> CoreResult<()> {
        self.session.send(frame)
    }

    /// Whether the publish gate for `name` is currently open.
    pub fn is_subscribed(&self, name: &str) -> bool {
        lock(&self.shared.gates).get(name).copied().unwrap_or(false)
    }

    /// Publish an event, but only if the peer has subscribed to it.
    /// Returns whether a frame was transmitted.
    pub fn publish_event(&self, name: &str, body: Value) -> CoreResult<bool> {
        if !self.is_subscribed(name) {
            return Ok(false);
        }
        self.send_event(name, body)?;
        Ok(true)
    }

    /// Transmit an event unconditionally. From protocol 1.1.0 the event
    /// name rides in the header; older versions carry it in the body.
    pub fn send_event(&self, name: &str, body: Value) -> CoreResult<()> {
        let version = self.session.version();
        let mut frame = Frame::bare(version, Purpose::Event, body);
        if version >= ProtocolVersion::V1_1_0.as_u32() {
            frame.extra.event_name = Some(name.to_string());
        } else {
            match &mut frame.body {
                Value::Object(map) => {
                    map.insert("eventName".to_string(), Value::String(name.to_string()));
                }
                _ => {
                    return Err(CoreError::Codec(
                        "event body must be a JSON object before protocol 1.1.0".into(),
                    ))
                }
            }
        }
        self.session.send(&frame)
    }

    /// Send a chat frame against a live chat subscription.
    pub fn send_chat(
        &self,
        subscription: Uuid,
        sender: &str,
        receiver: &str,
        message: &str,
        chat_type: &str,
    ) -> CoreResult<()> {
        let body = serde_json::json!({
            "sender": sender,
            "receiver": receiver,
            "message": message,
            "type": chat_type,
        });
        self.session.send(&Frame::response(
            self.session.version(),
            Purpose::Chat,
            subscription,
            body,
        ))
    }

    /// Register the responder for `data:<data_type>` requests. One
    /// responder per data type.
    pub fn set_data_responder(
        &self,
        data_type: &str,
        mut responder: impl FnMut(&DataRequest) + Send + 'static,
    ) -> CoreResult<()> {
        let kind = data_type.to_string();
        self.session.set_handler(
            Purpose::DataRequest(kind.clone()),
            Box::new(move |session, frame| {
                responder(&DataRequest {
                    session: session.clone(),
                    request_id: frame.request_id,
                    data_type: kind.clone(),
                });
                Ok(HandlerOutcome::Keep)
            }),
        )
    }

    /// Remove a data responder; returns whether one was registered.
    pub fn clear_data_responder(&self, data_type: &str) -> bool {
        self.session
            .clear_handler(&Purpose::DataRequest(data_type.to_string()))
    }

    /// Close the connection.
    pub fn disconnect(&self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_args_with_mode() {
        let args = r#""cHVibGlj" "c2FsdA==" "cfb8""#;
        let (public, salt, mode) = parse_handshake_args(args).unwrap();
        assert_eq!(public, "cHVibGlj");
        assert_eq!(salt, "c2FsdA==");
        assert_eq!(mode, EncryptionMode::Cfb8);
    }

    #[test]
    fn handshake_args_default_mode() {
        let (_, _, mode) = parse_handshake_args(r#""a" "b""#).unwrap();
        assert_eq!(mode, EncryptionMode::Cfb8);
    }

    #[test]
    fn handshake_args_cfb128_alias() {
        let (_, _, mode) = parse_handshake_args(r#""a" "b" "cfb128""#).unwrap();
        assert_eq!(mode, EncryptionMode::Cfb);
    }

    #[test]
    fn handshake_args_bare_mode_token() {
        let (_, _, mode) = parse_handshake_args(r#""a" "b" cfb"#).unwrap();
        assert_eq!(mode, EncryptionMode::Cfb);
    }

    #[test]
    fn handshake_args_missing() {
        assert!(parse_handshake_args(r#""only-one""#).is_err());
        assert!(parse_handshake_args(r#""a" "b" "rot13""#).is_err());
    }
}
