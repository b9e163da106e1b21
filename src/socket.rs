//! Realtime message sockets.
//!
//! Socket state lives here; the transport behind it is a [`SocketBackend`].
//! Backends report lifecycle events through `poll`, and the event loop turns
//! each event into a callback on the handler registered for its kind.
//!
//! [`NetworkBackend`] speaks the WebSocket protocol over TCP through
//! `tungstenite`. [`LoopbackBackend`] echoes in-process and never touches the
//! network.

use crate::config::{SocketBackendKind, SocketConfig};
use crate::error::{BridgeError, BridgeResult, HostError};
use crate::value::{Arena, ClosureId, SocketId};
use hostbind_abi::{ReadyState, SocketEventKind};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::net::TcpStream;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::Message;

/// Close code reported when `close` was called without one.
pub const NO_STATUS: u16 = 1005;
/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(Payload),
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error(String),
}

impl SocketEvent {
    pub fn kind(&self) -> SocketEventKind {
        match self {
            SocketEvent::Open => SocketEventKind::Open,
            SocketEvent::Message(_) => SocketEventKind::Message,
            SocketEvent::Close { .. } => SocketEventKind::Close,
            SocketEvent::Error(_) => SocketEventKind::Error,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            SocketEvent::Open => "open",
            SocketEvent::Message(_) => "message",
            SocketEvent::Close { .. } => "close",
            SocketEvent::Error(_) => "error",
        }
    }
}

/// Transport for sockets.
pub trait SocketBackend: Send {
    fn connect(&mut self, id: SocketId, url: &url::Url) -> Result<(), HostError>;

    fn send(&mut self, id: SocketId, payload: Payload) -> Result<(), HostError>;

    fn close(&mut self, id: SocketId, code: Option<u16>, reason: &str) -> Result<(), HostError>;

    /// Whether `poll` would return an event.
    fn pending(&self) -> bool;

    fn poll(&mut self) -> Option<(SocketId, SocketEvent)>;

    /// Whether events may still arrive later without the guest acting, so
    /// the event loop should keep polling.
    fn awaiting(&self) -> bool {
        false
    }
}

/// The backend named by a config's socket section.
pub fn backend_from_config(config: &SocketConfig) -> Box<dyn SocketBackend> {
    match config.backend {
        SocketBackendKind::Network => Box::new(NetworkBackend::new()),
        SocketBackendKind::Loopback => Box::new(LoopbackBackend::new()),
    }
}

/// In-process endpoint that echoes every message back to its sender.
#[derive(Debug, Default)]
pub struct LoopbackBackend {
    events: VecDeque<(SocketId, SocketEvent)>,
    refused_hosts: HashSet<String>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections to `host` fail with an error followed by an abnormal close.
    pub fn refuse(mut self, host: impl Into<String>) -> Self {
        self.refused_hosts.insert(host.into());
        self
    }
}

impl SocketBackend for LoopbackBackend {
    fn connect(&mut self, id: SocketId, url: &url::Url) -> Result<(), HostError> {
        let host = url.host_str().unwrap_or_default();
        if self.refused_hosts.contains(host) {
            self.events
                .push_back((id, SocketEvent::Error(format!("connection to {host} refused"))));
            self.events.push_back((
                id,
                SocketEvent::Close {
                    code: ABNORMAL_CLOSURE,
                    reason: String::new(),
                    was_clean: false,
                },
            ));
        } else {
            self.events.push_back((id, SocketEvent::Open));
        }
        Ok(())
    }

    fn send(&mut self, id: SocketId, payload: Payload) -> Result<(), HostError> {
        self.events.push_back((id, SocketEvent::Message(payload)));
        Ok(())
    }

    fn close(&mut self, id: SocketId, code: Option<u16>, reason: &str) -> Result<(), HostError> {
        self.events.push_back((
            id,
            SocketEvent::Close {
                code: code.unwrap_or(NO_STATUS),
                reason: reason.to_string(),
                was_clean: true,
            },
        ));
        Ok(())
    }

    fn pending(&self) -> bool {
        !self.events.is_empty()
    }

    fn poll(&mut self) -> Option<(SocketId, SocketEvent)> {
        self.events.pop_front()
    }
}

type Connection = tungstenite::WebSocket<MaybeTlsStream<TcpStream>>;

/// Client connections over TCP, with TLS for `wss`.
///
/// The handshake blocks the opening call; afterwards the stream is switched
/// to non-blocking mode and drained on every `poll`.
#[derive(Default)]
pub struct NetworkBackend {
    connections: HashMap<SocketId, Connection>,
    events: VecDeque<(SocketId, SocketEvent)>,
}

impl NetworkBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the connection and report an error followed by an abnormal close.
    fn fail(&mut self, id: SocketId, message: String) {
        tracing::debug!(socket = %id, error = %message, "socket failed");
        self.connections.remove(&id);
        self.events.push_back((id, SocketEvent::Error(message)));
        self.events.push_back((
            id,
            SocketEvent::Close {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
                was_clean: false,
            },
        ));
    }

    /// Read everything `id` has buffered without blocking.
    fn drain(&mut self, id: SocketId) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        let ended = loop {
            match connection.read() {
                Ok(Message::Text(text)) => self
                    .events
                    .push_back((id, SocketEvent::Message(Payload::Text(text)))),
                Ok(Message::Binary(bytes)) => self
                    .events
                    .push_back((id, SocketEvent::Message(Payload::Binary(bytes)))),
                // Pongs to incoming pings are queued by tungstenite itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    // Flush our half of the closing handshake.
                    let _ = connection.flush();
                    let (code, reason) = frame.map_or((NO_STATUS, String::new()), |frame| {
                        (u16::from(frame.code), frame.reason.into_owned())
                    });
                    break Some(Ok(SocketEvent::Close {
                        code,
                        reason,
                        was_clean: true,
                    }));
                }
                Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => break None,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    break Some(Ok(SocketEvent::Close {
                        code: ABNORMAL_CLOSURE,
                        reason: String::new(),
                        was_clean: false,
                    }))
                }
                Err(err) => break Some(Err(err.to_string())),
            }
        };
        match ended {
            None => {}
            Some(Ok(close)) => {
                self.connections.remove(&id);
                self.events.push_back((id, close));
            }
            Some(Err(message)) => self.fail(id, message),
        }
    }
}

fn set_nonblocking(connection: &mut Connection) -> std::io::Result<()> {
    match connection.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_nonblocking(true),
        MaybeTlsStream::Rustls(stream) => stream.get_ref().set_nonblocking(true),
        _ => Ok(()),
    }
}

fn would_block(err: &tungstenite::Error) -> bool {
    matches!(err, tungstenite::Error::Io(io) if io.kind() == ErrorKind::WouldBlock)
}

impl SocketBackend for NetworkBackend {
    fn connect(&mut self, id: SocketId, url: &url::Url) -> Result<(), HostError> {
        match tungstenite::connect(url.as_str()) {
            Ok((mut connection, response)) => {
                if let Err(err) = set_nonblocking(&mut connection) {
                    self.fail(id, format!("cannot poll connection to {url}: {err}"));
                    return Ok(());
                }
                tracing::debug!(socket = %id, status = %response.status(), "socket handshake complete");
                self.connections.insert(id, connection);
                self.events.push_back((id, SocketEvent::Open));
            }
            Err(err) => self.fail(id, format!("connection to {url} failed: {err}")),
        }
        Ok(())
    }

    fn send(&mut self, id: SocketId, payload: Payload) -> Result<(), HostError> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let message = match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(bytes) => Message::Binary(bytes),
        };
        match connection.send(message) {
            // A blocked write stays buffered and is flushed by later reads.
            Ok(()) => Ok(()),
            Err(err) if would_block(&err) => Ok(()),
            Err(err) => {
                self.fail(id, format!("send failed: {err}"));
                Ok(())
            }
        }
    }

    fn close(&mut self, id: SocketId, code: Option<u16>, reason: &str) -> Result<(), HostError> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let frame = code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        });
        match connection.close(frame) {
            Ok(()) => Ok(()),
            Err(err) if would_block(&err) => Ok(()),
            Err(err) => {
                self.fail(id, format!("close failed: {err}"));
                Ok(())
            }
        }
    }

    fn pending(&self) -> bool {
        !self.events.is_empty()
    }

    fn poll(&mut self) -> Option<(SocketId, SocketEvent)> {
        if self.events.is_empty() {
            let ids: Vec<SocketId> = self.connections.keys().copied().collect();
            for id in ids {
                self.drain(id);
            }
        }
        self.events.pop_front()
    }

    fn awaiting(&self) -> bool {
        !self.connections.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SocketRecord {
    pub url: String,
    pub state: ReadyState,
    handlers: [Option<ClosureId>; SocketEventKind::COUNT],
}

pub struct Sockets {
    records: Arena<SocketId, SocketRecord>,
    backend: Box<dyn SocketBackend>,
}

impl Sockets {
    pub fn new(backend: Box<dyn SocketBackend>) -> Self {
        Self {
            records: Arena::new(),
            backend,
        }
    }

    fn record(&self, id: SocketId) -> BridgeResult<&SocketRecord> {
        self.records
            .get(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown socket {id}")))
    }

    fn record_mut(&mut self, id: SocketId) -> BridgeResult<&mut SocketRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown socket {id}")))
    }

    pub fn open(&mut self, url: &str) -> BridgeResult<SocketId> {
        let parsed = url::Url::parse(url)
            .map_err(|err| HostError::syntax_error(format!("invalid socket URL {url}: {err}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(HostError::syntax_error(format!(
                "socket URL scheme must be ws or wss, got {}",
                parsed.scheme()
            ))
            .into());
        }
        if parsed.fragment().is_some() {
            return Err(HostError::syntax_error("socket URLs cannot contain a fragment").into());
        }

        let id = self.records.insert(SocketRecord {
            url: parsed.to_string(),
            state: ReadyState::Connecting,
            handlers: [None; SocketEventKind::COUNT],
        });
        self.backend.connect(id, &parsed)?;
        tracing::debug!(socket = %id, url = %parsed, "socket connecting");
        Ok(id)
    }

    /// Set the handler for `kind`, returning the one it replaces.
    pub fn on(&mut self, id: SocketId, kind: SocketEventKind, closure: ClosureId) -> BridgeResult<Option<ClosureId>> {
        let record = self.record_mut(id)?;
        Ok(record.handlers[kind.index()].replace(closure))
    }

    pub fn handler(&self, id: SocketId, kind: SocketEventKind) -> BridgeResult<Option<ClosureId>> {
        Ok(self.record(id)?.handlers[kind.index()])
    }

    pub fn ready_state(&self, id: SocketId) -> BridgeResult<ReadyState> {
        Ok(self.record(id)?.state)
    }

    /// Send on an open socket. Data sent after `close` is discarded.
    pub fn send(&mut self, id: SocketId, payload: Payload) -> BridgeResult<()> {
        match self.record(id)?.state {
            ReadyState::Connecting => {
                Err(HostError::invalid_state("socket is still in CONNECTING state").into())
            }
            ReadyState::Open => Ok(self.backend.send(id, payload)?),
            ReadyState::Closing | ReadyState::Closed => {
                tracing::debug!(socket = %id, "discarding send on closing socket");
                Ok(())
            }
        }
    }

    pub fn close(&mut self, id: SocketId, code: Option<u16>, reason: &str) -> BridgeResult<()> {
        if let Some(code) = code {
            if code != 1000 && !(3000..=4999).contains(&code) {
                return Err(HostError::new(
                    "InvalidAccessError",
                    format!("close code must be 1000 or in 3000-4999, got {code}"),
                )
                .into());
            }
        }
        if reason.len() > 123 {
            return Err(HostError::syntax_error("close reason must not exceed 123 bytes").into());
        }

        let record = self.record_mut(id)?;
        if matches!(record.state, ReadyState::Closing | ReadyState::Closed) {
            return Ok(());
        }
        record.state = ReadyState::Closing;
        self.backend.close(id, code, reason)?;
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.backend.pending()
    }

    /// Whether open connections may still produce events.
    pub fn is_awaiting(&self) -> bool {
        self.backend.awaiting()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget socket `id` once it has closed.
    pub fn reclaim(&mut self, id: SocketId) {
        if self
            .records
            .get(id)
            .is_some_and(|record| record.state == ReadyState::Closed)
        {
            self.records.remove(id);
        }
    }

    /// Next transport event, with the socket's state already updated.
    pub fn next_event(&mut self) -> Option<(SocketId, SocketEvent)> {
        while let Some((id, event)) = self.backend.poll() {
            let Some(record) = self.records.get_mut(id) else {
                tracing::warn!(socket = %id, "event for unknown socket dropped");
                continue;
            };
            match &event {
                SocketEvent::Open if record.state == ReadyState::Connecting => {
                    record.state = ReadyState::Open;
                }
                SocketEvent::Close { .. } => record.state = ReadyState::Closed,
                _ => {}
            }
            return Some((id, event));
        }
        None
    }
}
