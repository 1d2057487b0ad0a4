//! In-crate tests drive a real connection over a recording transport:
//! client bytes go in as transport events, and assertions read the exact
//! writes the peer would have seen.

mod connection;

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::task::JoinHandle;

use drover_codec::frame::{self, Frame, Parsed};
use drover_codec::qpack::{self, HeaderField};
use drover_codec::stream::{Fin, StreamId};
use drover_codec::varint::write_varint;

use crate::connection::{Connection, Event, EventSender};
use crate::error::Error;
use crate::handler::StreamHandler;
use crate::transport::{SendFlag, ShutdownFlag, StreamDir, Transport, TransportEvent, WriteBuf};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn sid(v: u64) -> StreamId {
    StreamId::try_from(v).unwrap()
}

/// Everything the connection asked the transport to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    StartStream { id: StreamId, bidi: bool },
    Send { id: StreamId, data: Bytes, fin: bool },
    Sendfile { id: StreamId, path: PathBuf, offset: u64, len: u64 },
    ShutdownStream { id: StreamId, flag: ShutdownFlag, code: u64 },
    ShutdownConnection { code: u64 },
    SetActive { id: StreamId },
}

pub(crate) type Ops = Arc<Mutex<Vec<Op>>>;

#[derive(Debug)]
pub(crate) struct MockTransport {
    ops: Ops,
    next_unidi: u64,
}

impl MockTransport {
    pub(crate) fn new() -> (Self, Ops) {
        let ops = Ops::default();
        (
            Self {
                ops: ops.clone(),
                // Server-initiated unidirectional ids: 3, 7, 11, ...
                next_unidi: 3,
            },
            ops,
        )
    }

    fn record(&self, op: Op) {
        self.ops.lock().expect("ops lock").push(op);
    }
}

#[derive(Debug)]
pub(crate) struct MockError;

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("mock transport error")
    }
}

impl std::error::Error for MockError {}

impl Transport for MockTransport {
    type Error = MockError;

    fn start_stream(&mut self, dir: StreamDir) -> Result<StreamId, MockError> {
        let id = StreamId::try_from(self.next_unidi).map_err(|_| MockError)?;
        self.next_unidi += 4;
        self.record(Op::StartStream {
            id,
            bidi: dir == StreamDir::Bidirectional,
        });
        Ok(id)
    }

    fn send(&mut self, id: StreamId, data: WriteBuf, flag: SendFlag) -> Result<(), MockError> {
        self.record(Op::Send {
            id,
            data: data.into_bytes(),
            fin: flag == SendFlag::Fin,
        });
        Ok(())
    }

    fn sendfile(&mut self, id: StreamId, path: &Path, offset: u64, len: u64) -> Result<(), MockError> {
        self.record(Op::Sendfile {
            id,
            path: path.to_path_buf(),
            offset,
            len,
        });
        Ok(())
    }

    fn shutdown_stream(&mut self, id: StreamId, flag: ShutdownFlag, code: u64) {
        self.record(Op::ShutdownStream { id, flag, code });
    }

    fn shutdown_connection(&mut self, _flag: ShutdownFlag, code: u64) {
        self.record(Op::ShutdownConnection { code });
    }

    fn peername(&self) -> Result<SocketAddr, MockError> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 52100)))
    }

    fn sockname(&self) -> Result<SocketAddr, MockError> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 4433)))
    }

    fn set_active(&mut self, id: StreamId) -> Result<(), MockError> {
        self.record(Op::SetActive { id });
        Ok(())
    }
}

/// A running connection plus the client's view of it.
pub(crate) struct Peer {
    pub(crate) tx: EventSender,
    pub(crate) ops: Ops,
    task: JoinHandle<Result<(), Error>>,
}

pub(crate) fn connect<H: StreamHandler>(handler: H) -> Peer {
    init_tracing();
    let mut opts = crate::builder();
    opts.send_grease(false);
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let (transport, ops) = MockTransport::new();
    let conn = Connection::init(transport, handler, &opts, rx, tx.clone()).expect("connection init");
    let task = tokio::spawn(conn.run());
    Peer { tx, ops, task }
}

impl Peer {
    pub(crate) fn event(&self, event: TransportEvent) {
        let _ = self.tx.send(Event::Transport(event));
    }

    pub(crate) fn open_bidi(&self, id: u64) {
        self.event(TransportEvent::NewStream { id: sid(id), bidi: true });
    }

    pub(crate) fn open_uni(&self, id: u64) {
        self.event(TransportEvent::NewStream { id: sid(id), bidi: false });
    }

    pub(crate) fn data(&self, id: u64, fin: Fin, data: impl Into<Bytes>) {
        self.event(TransportEvent::Data {
            id: sid(id),
            fin,
            data: data.into(),
        });
    }

    /// Open the peer's control stream and send its SETTINGS.
    pub(crate) fn open_control(&self, id: u64) {
        self.open_uni(id);
        self.data(id, Fin::NoFin, Bytes::from_static(&[0x00, 0x04, 0x00]));
    }

    /// Close the transport and collect the outcome.
    pub(crate) async fn close(self) -> (Result<(), Error>, Vec<Op>) {
        let _ = self.tx.send(Event::Transport(TransportEvent::Closed));
        self.finished().await
    }

    /// Wait for a connection that terminates on its own.
    pub(crate) async fn finished(self) -> (Result<(), Error>, Vec<Op>) {
        let result = self.task.await.expect("connection task");
        let ops = self.ops.lock().expect("ops lock").clone();
        (result, ops)
    }
}

// Client-side wire building.

pub(crate) fn headers_frame(fields: Vec<HeaderField>) -> Bytes {
    let mut block = BytesMut::new();
    qpack::encode_stateless(&mut block, fields);
    let mut buf = BytesMut::new();
    buf.put_u8(0x01);
    write_varint(&mut buf, block.len() as u64);
    buf.extend_from_slice(&block);
    buf.freeze()
}

pub(crate) fn data_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(0x00);
    write_varint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    buf.freeze()
}

pub(crate) fn get_request(path: &str) -> Vec<HeaderField> {
    vec![
        (":method", "GET").into(),
        (":scheme", "https").into(),
        (":authority", "localhost").into(),
        (":path", path).into(),
    ]
}

// Server-side wire reading.

/// A decoded frame as the peer would see it.
#[derive(Debug)]
pub(crate) enum WireFrame {
    Headers(Vec<HeaderField>),
    Data(Bytes),
}

impl WireFrame {
    pub(crate) fn status(&self) -> Option<&str> {
        let Self::Headers(fields) = self else {
            return None;
        };
        fields
            .iter()
            .find(|f| f.name.as_ref() == b":status")
            .and_then(|f| std::str::from_utf8(&f.value).ok())
    }
}

/// All `Send` payloads for a stream, concatenated in write order, with
/// whether the last one carried fin.
pub(crate) fn stream_writes(ops: &[Op], id: u64) -> (Bytes, bool) {
    let mut data = BytesMut::new();
    let mut fin = false;
    for op in ops {
        if let Op::Send { id: op_id, data: bytes, fin: op_fin } = op {
            if *op_id == sid(id) {
                data.extend_from_slice(bytes);
                fin = *op_fin;
            }
        }
    }
    (data.freeze(), fin)
}

/// Parse a stream's writes back into frames.
pub(crate) fn parse_wire(mut data: Bytes) -> Vec<WireFrame> {
    let mut frames = Vec::new();
    while !data.is_empty() {
        match frame::parse(data.clone()) {
            Ok(Parsed::Frame(Frame::Headers(mut block), rest)) => {
                let decoded = qpack::decode_stateless(&mut block, u64::MAX).expect("header block");
                frames.push(WireFrame::Headers(decoded.fields));
                data = rest;
            }
            Ok(Parsed::DataHeader { len, mut rest }) => {
                let payload = rest.split_to(len as usize);
                frames.push(WireFrame::Data(payload));
                data = rest;
            }
            other => panic!("unexpected wire data: {other:?}"),
        }
    }
    frames
}
