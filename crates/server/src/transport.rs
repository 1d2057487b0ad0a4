//! The QUIC transport contract.
//!
//! The transport is an external collaborator: it owns datagram I/O, loss
//! recovery, flow control and the crypto handshake. The connection core
//! only needs the small synchronous surface below, plus the stream of
//! [`TransportEvent`]s the transport pushes onto the connection inbox.

use std::net::SocketAddr;
use std::path::Path;

use bytes::{Bytes, BytesMut};

use drover_codec::stream::{Fin, StreamId};

/// Direction of a locally opened stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamDir {
    Unidirectional,
    Bidirectional,
}

/// Flags for a stream write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendFlag {
    /// More data may follow on this stream half.
    None,
    /// Finish the send half with this write.
    Fin,
}

impl From<Fin> for SendFlag {
    fn from(fin: Fin) -> Self {
        match fin {
            Fin::Fin => Self::Fin,
            Fin::NoFin => Self::None,
        }
    }
}

/// Which halves of a stream to shut down.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownFlag {
    /// Abort both the send and receive halves.
    Abort,
    /// Abort only the receive half.
    AbortReceive,
}

/// What the transport tells the connection task. Delivered as messages on
/// the connection inbox; the connection never polls the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// Bytes arrived on a stream.
    Data { id: StreamId, fin: Fin, data: Bytes },
    /// The peer opened a stream.
    NewStream { id: StreamId, bidi: bool },
    /// A stream was closed at the transport level.
    StreamClosed { id: StreamId },
    /// The connection is gone.
    Closed,
    /// The transport started shutting the connection down.
    Shutdown,
    /// The peer shut down its send half of a stream.
    PeerSendShutdown { id: StreamId },
    /// A local send shutdown completed.
    SendShutdownComplete { id: StreamId },
}

/// An iolist-style write buffer: framing headers and payloads are chained
/// so one logical write reaches the transport as one call, without
/// copying payload bytes.
#[derive(Debug, Clone, Default)]
pub struct WriteBuf {
    parts: Vec<Bytes>,
}

impl WriteBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, part: Bytes) {
        if !part.is_empty() {
            self.parts.push(part);
        }
    }

    /// Total byte length across all parts.
    pub fn len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Flatten into one contiguous buffer.
    pub fn into_bytes(self) -> Bytes {
        match self.parts.len() {
            0 => Bytes::new(),
            1 => self.parts.into_iter().next().unwrap_or_default(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.parts.iter().map(Bytes::len).sum());
                for part in &self.parts {
                    buf.extend_from_slice(part);
                }
                buf.freeze()
            }
        }
    }
}

impl From<Bytes> for WriteBuf {
    fn from(part: Bytes) -> Self {
        let mut buf = Self::new();
        buf.push(part);
        buf
    }
}

/// The write-side surface of a QUIC connection.
///
/// All calls are made from the connection task and are expected to be
/// non-blocking; the transport buffers or rejects. A failed `send` is
/// logged, not fatal: if the connection is really gone the transport
/// reports [`TransportEvent::Closed`].
pub trait Transport: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a locally initiated stream.
    fn start_stream(&mut self, dir: StreamDir) -> Result<StreamId, Self::Error>;

    /// Write `data` on a stream.
    fn send(&mut self, id: StreamId, data: WriteBuf, flag: SendFlag) -> Result<(), Self::Error>;

    /// Stream `len` bytes of a file starting at `offset` on a stream.
    fn sendfile(&mut self, id: StreamId, path: &Path, offset: u64, len: u64) -> Result<(), Self::Error>;

    /// Abort stream halves with an application error code.
    fn shutdown_stream(&mut self, id: StreamId, flag: ShutdownFlag, code: u64);

    /// Close the connection with an application error code.
    fn shutdown_connection(&mut self, flag: ShutdownFlag, code: u64);

    fn peername(&self) -> Result<SocketAddr, Self::Error>;

    fn sockname(&self) -> Result<SocketAddr, Self::Error>;

    /// Enable active delivery of data events for a peer-opened stream.
    fn set_active(&mut self, id: StreamId) -> Result<(), Self::Error>;
}
