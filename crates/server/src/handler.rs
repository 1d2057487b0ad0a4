//! The stream handler contract: the pluggable per-request pipeline.
//!
//! Handler callbacks run on the connection task, between inbox receives;
//! they return commands the response serializer executes in order. Work
//! that must not block the connection belongs in spawned tasks, which
//! talk back through the request's [`StreamSender`].

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use http::uri::Scheme;
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;

use drover_codec::stream::{Fin, StreamId};

use crate::children::{ChildExit, ChildId, Shutdown};
use crate::connection::Event;
use crate::error::Reason;

/// The transport a request arrived over.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportKind {
    Quic,
}

/// An assembled request, handed to [`StreamHandler::init`].
#[derive(Debug, Clone)]
pub struct Request {
    pub transport: TransportKind,
    /// The request stream, which doubles as the public request id.
    pub stream: StreamId,
    /// Back-channel for messages addressed to this stream's handler.
    pub reply: StreamSender,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub method: Method,
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    /// The raw query string, without the '?'.
    pub qs: String,
    pub version: Version,
    /// Request headers, one value per name; duplicates were merged with
    /// `", "`, except `cookie` which merges with `"; "`.
    pub headers: HeaderMap,
    pub has_body: bool,
    /// Declared `content-length`, if any.
    pub body_length: Option<u64>,
}

/// A response body.
#[derive(Debug, Clone)]
pub enum Body {
    Full(Bytes),
    /// `len` bytes of a file starting at `offset`, streamed through the
    /// transport's sendfile path.
    Sendfile { path: PathBuf, offset: u64, len: u64 },
}

impl Body {
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    /// A zero-length sendfile counts as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Full(bytes) => bytes.is_empty(),
            Self::Sendfile { len, .. } => *len == 0,
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Self::Full(Bytes::from(v))
    }
}

/// A task to supervise on behalf of a stream.
#[derive(Debug)]
pub struct ChildSpec {
    pub handle: JoinHandle<()>,
    pub shutdown: Shutdown,
}

/// A log line emitted through the connection's logger.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
}

/// Reserved server-push descriptor; accepted and ignored.
#[derive(Debug, Clone)]
pub struct PushSpec {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

/// What a handler asks the connection to do, executed in order.
#[derive(Debug)]
pub enum Command {
    /// Send a 1xx interim response.
    Inform(StatusCode, HeaderMap),
    /// Send a complete response: headers plus body, finishing the stream.
    Response(StatusCode, HeaderMap, Body),
    /// Send final response headers, leaving the stream open for data.
    Headers(StatusCode, HeaderMap),
    /// Send body data; `Fin::Fin` finishes the stream.
    Data(Fin, Body),
    /// Finish the stream with trailers (or an empty DATA frame when the
    /// map is empty).
    Trailers(HeaderMap),
    /// Grow the receive window. Currently a no-op placeholder.
    Flow(u64),
    /// Put a task under this stream's supervision.
    Spawn(ChildSpec),
    /// Per-stream options; accepted silently.
    SetOptions(StreamOptions),
    Log(LogEntry),
    /// End this stream now, completing the response if needed.
    Stop,
    /// Like `Response`, but dropped if a response was already sent.
    ErrorResponse(StatusCode, HeaderMap, Body),
    /// Reserved; not implemented.
    Push(PushSpec),
}

/// Per-stream tunables a handler may set. Nothing is currently honored.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct StreamOptions {}

pub type Commands = Vec<Command>;

/// Messages delivered to [`StreamHandler::info`].
pub enum InfoMsg {
    /// A supervised child of this stream exited.
    ChildExit { child: ChildId, exit: ChildExit },
    /// An arbitrary message sent through the stream's [`StreamSender`].
    Message(Box<dyn Any + Send>),
}

impl fmt::Debug for InfoMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChildExit { child, exit } => f
                .debug_struct("ChildExit")
                .field("child", child)
                .field("exit", exit)
                .finish(),
            Self::Message(_) => f.write_str("Message(..)"),
        }
    }
}

/// Address of a stream's handler: any task holding one can mail the
/// connection, which forwards to [`StreamHandler::info`].
#[derive(Debug, Clone)]
pub struct StreamSender {
    pub(crate) tx: mpsc::UnboundedSender<Event>,
    pub(crate) id: StreamId,
}

impl StreamSender {
    /// Deliver `msg` to the stream's handler. Returns `false` if the
    /// connection is gone.
    pub fn send<M: Any + Send>(&self, msg: M) -> bool {
        self.tx
            .send(Event::StreamMessage {
                id: self.id,
                msg: Box::new(msg),
            })
            .is_ok()
    }

    pub fn stream(&self) -> StreamId {
        self.id
    }
}

/// The per-stream request processor.
///
/// Callbacks are synchronous and run on the connection task. A panic in
/// any callback is caught, logged via [`StreamHandler::make_error_log`]
/// and turned into a stream reset with `H3_INTERNAL_ERROR`.
pub trait StreamHandler: Send + Sync + 'static {
    /// Per-stream state, threaded through the callbacks.
    type State: Send + 'static;

    /// A request head is complete.
    fn init(&self, id: StreamId, req: Request) -> (Commands, Self::State);

    /// A chunk of the request body arrived. `Fin::Fin` marks the last
    /// chunk.
    fn data(&self, id: StreamId, fin: Fin, data: Bytes, state: &mut Self::State) -> Commands;

    /// A message addressed to this stream arrived.
    fn info(&self, id: StreamId, msg: InfoMsg, state: &mut Self::State) -> Commands {
        let _ = (id, msg, state);
        Vec::new()
    }

    /// The stream is going away; release resources.
    fn terminate(&self, id: StreamId, reason: &Reason, state: Self::State) {
        let _ = (id, reason, state);
    }

    /// Render a crash report for a panicking callback.
    fn make_error_log(&self, op: &'static str, id: StreamId, detail: &str) -> String {
        format!("stream handler crashed in {op} for {id}: {detail}")
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("panic payload of unknown type")
}
