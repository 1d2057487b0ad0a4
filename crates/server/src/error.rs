//! Failure taxonomy for streams and connections.

use std::borrow::Cow;
use std::fmt;

use drover_codec::error::Code;
use drover_machine::MachineError;

/// Why a stream or the whole connection ended. The same type is handed to
/// stream handlers in their `terminate` callback and wrapped in [`Error`]
/// when the connection loop exits abnormally.
#[derive(Debug, Clone)]
pub enum Reason {
    /// Clean completion.
    Normal,
    /// A protocol violation scoped to one stream; the connection
    /// continues.
    StreamError(Code, Cow<'static, str>),
    /// A stream handler callback panicked.
    InternalError(String),
    /// A protocol violation that kills the connection.
    ConnectionError(Code, Cow<'static, str>),
    /// The transport failed underneath us.
    SocketError(Cow<'static, str>),
    /// Normal connection shutdown (peer goaway, transport closed).
    Stop(Cow<'static, str>),
}

impl Reason {
    /// The application error code signalled on the wire for this reason.
    pub fn code(&self) -> Code {
        match self {
            Self::Normal | Self::Stop(_) => Code::H3_NO_ERROR,
            Self::StreamError(code, _) | Self::ConnectionError(code, _) => *code,
            Self::InternalError(_) | Self::SocketError(_) => Code::H3_INTERNAL_ERROR,
        }
    }

    pub(crate) fn is_error(&self) -> bool {
        !matches!(self, Self::Normal | Self::Stop(_))
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::StreamError(code, reason) => write!(f, "stream error {code:?}: {reason}"),
            Self::InternalError(detail) => write!(f, "internal error: {detail}"),
            Self::ConnectionError(code, reason) => write!(f, "connection error {code:?}: {reason}"),
            Self::SocketError(reason) => write!(f, "socket error: {reason}"),
            Self::Stop(reason) => write!(f, "stop: {reason}"),
        }
    }
}

impl From<MachineError> for Reason {
    fn from(e: MachineError) -> Self {
        match e {
            MachineError::Stream(code, reason) => Self::StreamError(code, reason),
            MachineError::Connection(code, reason) => Self::ConnectionError(code, reason),
        }
    }
}

/// Terminal failure returned by the connection loop. Clean shutdowns
/// ([`Reason::Stop`], a closed transport) are not errors.
#[derive(Debug)]
pub struct Error {
    reason: Reason,
}

impl Error {
    pub fn reason(&self) -> &Reason {
        &self.reason
    }
}

impl From<Reason> for Error {
    fn from(reason: Reason) -> Self {
        Self { reason }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.reason.fmt(f)
    }
}

impl std::error::Error for Error {}
