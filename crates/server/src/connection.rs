//! The per-connection actor.
//!
//! One task owns all connection state and blocks only on its inbox; every
//! transport event, handler message and child exit is a message, and all
//! processing between receives is synchronous. That serialization is the
//! ordering contract: writes for a stream happen in the exact order the
//! commands reach the inbox.

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderName, HeaderValue};
use http::uri::{Authority, Scheme};
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn, Level};

use drover_codec::error::Code;
use drover_codec::frame::{self, Frame, FrameType, Parsed, UnidiType};
use drover_codec::headers::Header;
use drover_codec::stream::{Fin, StreamId, StreamType};
use drover_codec::varint::write_varint;
use drover_machine::{
    FrameOutcome, HeadersEvent, LocalState, Machine, MachineError, PreparedHeaders,
    PreparedTrailers, RemoteState, Role, UnidiKind,
};

use crate::children::{ChildExit, ChildId, Children, Down};
use crate::error::{Error, Reason};
use crate::handler::{
    panic_message, Body, ChildSpec, Command, Commands, InfoMsg, LogEntry, Request, StreamHandler,
    StreamSender, TransportKind,
};
use crate::opts::Builder;
use crate::streams::{Lingering, Status, Stream};
use crate::transport::{
    SendFlag, ShutdownFlag, StreamDir, Transport, TransportEvent, WriteBuf,
};

/// Everything the connection task can receive.
pub enum Event {
    /// An event pushed by the transport driver.
    Transport(TransportEvent),
    /// A message addressed to `(connection, stream)`, forwarded to the
    /// stream's handler.
    StreamMessage {
        id: StreamId,
        msg: Box<dyn Any + Send>,
    },
    /// A supervised child exited.
    ChildDown { id: ChildId, exit: ChildExit },
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(event) => f.debug_tuple("Transport").field(event).finish(),
            Self::StreamMessage { id, .. } => {
                f.debug_struct("StreamMessage").field("id", id).finish_non_exhaustive()
            }
            Self::ChildDown { id, exit } => f
                .debug_struct("ChildDown")
                .field("id", id)
                .field("exit", exit)
                .finish(),
        }
    }
}

/// Sending half of a connection inbox.
pub type EventSender = mpsc::UnboundedSender<Event>;
/// Receiving half of a connection inbox, owned by the connection task.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// The state of one accepted HTTP/3 connection.
pub struct Connection<T: Transport, H: StreamHandler> {
    transport: T,
    handler: Arc<H>,
    peer: SocketAddr,
    local: SocketAddr,
    machine: Machine,
    streams: HashMap<StreamId, Stream<H::State>>,
    lingering: Lingering,
    children: Children,
    events: EventReceiver,
    tx: EventSender,
    local_encoder: StreamId,
    local_decoder: StreamId,
}

impl<T: Transport, H: StreamHandler> fmt::Debug for Connection<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport, H: StreamHandler> Connection<T, H> {
    /// Bring up the connection: capture addresses, open the local
    /// control/encoder/decoder streams and send SETTINGS. Any failure
    /// here is a socket error and the connection never enters its loop.
    pub fn init(
        mut transport: T,
        handler: H,
        opts: &Builder,
        events: EventReceiver,
        tx: EventSender,
    ) -> Result<Self, Error> {
        let peer = transport.peername().map_err(|e| socket_error("peername", &e))?;
        let local = transport.sockname().map_err(|e| socket_error("sockname", &e))?;

        let (settings, mut machine) = Machine::init(Role::Server, &opts.machine_config());

        let control = transport
            .start_stream(StreamDir::Unidirectional)
            .map_err(|e| socket_error("start control stream", &e))?;
        let encoder = transport
            .start_stream(StreamDir::Unidirectional)
            .map_err(|e| socket_error("start encoder stream", &e))?;
        let decoder = transport
            .start_stream(StreamDir::Unidirectional)
            .map_err(|e| socket_error("start decoder stream", &e))?;

        // SETTINGS must be the first frame of the control stream, sent as
        // soon as the transport can carry it.
        let mut first = WriteBuf::from(stream_type_byte(StreamType::CONTROL));
        first.push(settings);
        transport
            .send(control, first, SendFlag::None)
            .map_err(|e| socket_error("send settings", &e))?;
        transport
            .send(encoder, WriteBuf::from(stream_type_byte(StreamType::ENCODER)), SendFlag::None)
            .map_err(|e| socket_error("open encoder stream", &e))?;
        transport
            .send(decoder, WriteBuf::from(stream_type_byte(StreamType::DECODER)), SendFlag::None)
            .map_err(|e| socket_error("open decoder stream", &e))?;

        machine.init_unidi_local_streams(control, encoder, decoder);
        debug!("connection from {peer} up, control stream {control}");

        Ok(Self {
            transport,
            handler: Arc::new(handler),
            peer,
            local,
            machine,
            streams: HashMap::new(),
            lingering: Lingering::default(),
            children: Children::default(),
            events,
            tx,
            local_encoder: encoder,
            local_decoder: decoder,
        })
    }

    /// Run the connection to completion. Clean shutdowns return `Ok`.
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            let Some(event) = self.events.recv().await else {
                // Every sender is gone: the transport driver died without
                // delivering a closed event.
                return self.finish(Reason::SocketError(Cow::Borrowed("event channel closed")));
            };
            let result = match event {
                Event::Transport(TransportEvent::Data { id, fin, data }) => {
                    self.on_stream_data(id, fin, data)
                }
                Event::Transport(TransportEvent::NewStream { id, bidi }) => {
                    self.on_new_stream(id, bidi)
                }
                Event::Transport(TransportEvent::StreamClosed { id }) => self.on_stream_closed(id),
                Event::Transport(TransportEvent::Closed) => {
                    Err(Reason::Stop(Cow::Borrowed("transport closed")))
                }
                // Acknowledged but not acted upon; peer-initiated send
                // shutdown mid-body has no defined semantics yet.
                Event::Transport(TransportEvent::Shutdown)
                | Event::Transport(TransportEvent::PeerSendShutdown { .. })
                | Event::Transport(TransportEvent::SendShutdownComplete { .. }) => Ok(()),
                Event::StreamMessage { id, msg } => self.on_stream_message(id, msg),
                Event::ChildDown { id, exit } => self.on_child_down(id, exit),
            };
            if let Err(reason) = result {
                return self.finish(reason);
            }
        }
    }

    fn finish(&mut self, reason: Reason) -> Result<(), Error> {
        self.terminate_connection(&reason);
        if reason.is_error() {
            Err(Error::from(reason))
        } else {
            Ok(())
        }
    }

    fn on_new_stream(&mut self, id: StreamId, bidi: bool) -> Result<(), Reason> {
        if let Err(e) = self.transport.set_active(id) {
            warn!("could not activate {id}: {e}");
        }
        let status = if bidi {
            self.machine.init_bidi_stream(id);
            Status::Normal
        } else {
            self.machine.init_unidi_stream(id);
            Status::Header
        };
        self.streams.insert(id, Stream::new(status));
        Ok(())
    }

    fn on_stream_data(&mut self, id: StreamId, fin: Fin, data: Bytes) -> Result<(), Reason> {
        let Some(stream) = self.streams.get_mut(&id) else {
            if self.lingering.contains(id) {
                trace!("data on lingering {id}");
            } else {
                warn!("data on unknown {id}");
            }
            return Ok(());
        };
        let data = if stream.buffer.is_empty() {
            data
        } else {
            let mut joined = BytesMut::with_capacity(stream.buffer.len() + data.len());
            joined.extend_from_slice(&stream.buffer);
            joined.extend_from_slice(&data);
            stream.buffer = Bytes::new();
            joined.freeze()
        };
        self.parse(id, data, fin)
    }

    /// Feed a slice of stream bytes through the frame layer, looping over
    /// complete frames and re-buffering the incomplete tail.
    fn parse(&mut self, id: StreamId, mut data: Bytes, fin: Fin) -> Result<(), Reason> {
        loop {
            // Handler commands can reset the stream mid-loop.
            let Some(stream) = self.streams.get(&id) else {
                return Ok(());
            };
            match stream.status {
                Status::Header => match frame::parse_unidi_stream_header(data.clone()) {
                    Some((UnidiType::Control, rest)) => {
                        self.classify(id, UnidiKind::Control)?;
                        data = rest;
                    }
                    Some((UnidiType::Encoder, rest)) => {
                        self.classify(id, UnidiKind::Encoder)?;
                        data = rest;
                    }
                    Some((UnidiType::Decoder, rest)) => {
                        self.classify(id, UnidiKind::Decoder)?;
                        data = rest;
                    }
                    // A server does not accept peer-initiated push
                    // streams (RFC 9114, section 6.2.2).
                    Some((UnidiType::Push, _)) => {
                        return Err(Reason::ConnectionError(
                            Code::H3_STREAM_CREATION_ERROR,
                            Cow::Borrowed("client initiated a push stream"),
                        ));
                    }
                    Some((UnidiType::Unknown(ty), _)) => {
                        debug!("aborting receive on {id}: unknown stream type {ty:#x}");
                        self.transport.shutdown_stream(
                            id,
                            ShutdownFlag::AbortReceive,
                            Code::H3_STREAM_CREATION_ERROR.value(),
                        );
                        self.set_status(id, Status::Discard);
                        return Ok(());
                    }
                    None => {
                        self.set_buffer(id, data);
                        return Ok(());
                    }
                },
                Status::Data(len) => {
                    if (data.len() as u64) < len {
                        if fin.is_fin() {
                            return Err(truncated_frame());
                        }
                        let chunk = data;
                        self.set_status(id, Status::Data(len - chunk.len() as u64));
                        if !chunk.is_empty() {
                            self.stream_frame(id, Frame::Data(chunk), Fin::NoFin)?;
                        }
                        return Ok(());
                    }
                    let chunk = data.split_to(len as usize);
                    let frame_fin = Fin::of(fin, data.is_empty());
                    self.set_status(id, Status::Normal);
                    self.stream_frame(id, Frame::Data(chunk), frame_fin)?;
                }
                // The receive half was aborted; whatever was in flight is
                // dropped without allocating state.
                Status::Discard => return Ok(()),
                Status::Normal => {
                    // QPACK side streams carry instructions, not frames.
                    if let Some(kind @ (UnidiKind::Encoder | UnidiKind::Decoder)) =
                        self.machine.unidi_kind(id)
                    {
                        let leftover =
                            self.machine.qpack_stream_data(kind, data).map_err(Reason::from)?;
                        self.set_buffer(id, leftover);
                        return Ok(());
                    }
                    match frame::parse(data.clone()) {
                        Ok(Parsed::Frame(frame, rest)) => {
                            let frame_fin = Fin::of(fin, rest.is_empty());
                            self.stream_frame(id, frame, frame_fin)?;
                            data = rest;
                        }
                        Ok(Parsed::DataHeader { len, rest }) => {
                            self.set_status(id, Status::Data(len));
                            data = rest;
                        }
                        Ok(Parsed::Ignored(rest)) => {
                            self.machine.ignored_frame(id);
                            data = rest;
                        }
                        Ok(Parsed::More) => {
                            // A stream may not end inside a frame
                            // (RFC 9114, section 7.1).
                            if fin.is_fin() && !data.is_empty() {
                                return Err(truncated_frame());
                            }
                            self.set_buffer(id, data);
                            return Ok(());
                        }
                        Err(e) => {
                            return Err(Reason::ConnectionError(e.code(), e.to_string().into()));
                        }
                    }
                }
            }
        }
    }

    fn classify(&mut self, id: StreamId, kind: UnidiKind) -> Result<(), Reason> {
        self.machine.set_unidi_remote_stream_type(id, kind).map_err(Reason::from)?;
        self.set_status(id, Status::Normal);
        Ok(())
    }

    fn set_status(&mut self, id: StreamId, status: Status) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.status = status;
        }
    }

    fn set_buffer(&mut self, id: StreamId, buffer: Bytes) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.buffer = buffer;
        }
    }

    /// Feed one frame to the protocol machine and act on the outcome.
    fn stream_frame(&mut self, id: StreamId, frame: Frame, frame_fin: Fin) -> Result<(), Reason> {
        match self.machine.frame(frame, frame_fin, id) {
            Ok(FrameOutcome::Processed) => Ok(()),
            Ok(FrameOutcome::Headers(event)) => self.headers_event(id, event),
            Ok(FrameOutcome::Data(chunk)) => self.data_event(id, frame_fin, chunk),
            Ok(FrameOutcome::Trailers(trailers)) => {
                // Not forwarded to handlers yet.
                debug!("dropping {} trailer fields on {id}", trailers.len());
                Ok(())
            }
            Ok(FrameOutcome::GoAway(last)) => {
                debug!("peer goaway, last stream {last}");
                Err(Reason::Stop(Cow::Borrowed("peer is going away")))
            }
            Err(MachineError::Stream(code, reason)) => {
                self.reset_stream(id, Reason::StreamError(code, reason));
                Ok(())
            }
            Err(e @ MachineError::Connection(..)) => Err(Reason::from(e)),
        }
    }

    fn headers_event(&mut self, id: StreamId, event: HeadersEvent) -> Result<(), Reason> {
        let HeadersEvent {
            is_fin,
            header,
            body_len,
            decoder_data,
        } = event;
        if let Some(instructions) = decoder_data {
            self.side_write(self.local_decoder, instructions);
        }
        let request = match self.build_request(id, is_fin, header, body_len) {
            Ok(request) => request,
            Err(reason) => {
                self.reset_stream(id, reason);
                return Ok(());
            }
        };
        let handler = self.handler.clone();
        match catch_unwind(AssertUnwindSafe(|| handler.init(id, request))) {
            Ok((commands, state)) => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.state = Some(state);
                }
                self.run_commands(id, commands)
            }
            Err(payload) => {
                self.handler_crashed("init", id, payload.as_ref());
                Ok(())
            }
        }
    }

    /// Assemble the request value handed to the handler (authority, port
    /// defaulting, path split, header folding).
    fn build_request(
        &self,
        id: StreamId,
        is_fin: Fin,
        header: Header,
        body_len: Option<u64>,
    ) -> Result<Request, Reason> {
        let Header { pseudo, fields } = header;

        let method = pseudo.method.ok_or_else(|| message_error("missing :method"))?;
        let scheme = pseudo.scheme.ok_or_else(|| message_error("missing :scheme"))?;

        let authority = match pseudo.authority {
            Some(authority) => authority,
            None => fields
                .get(header::HOST)
                .ok_or_else(|| message_error("missing :authority and host"))?
                .to_str()
                .ok()
                .and_then(|host| host.parse::<Authority>().ok())
                .ok_or_else(|| message_error("invalid host header"))?,
        };
        let host = authority.host().to_string();
        let port = match authority.port_u16() {
            Some(port) => Some(port),
            None if scheme == Scheme::HTTP => Some(80),
            None if scheme == Scheme::HTTPS => Some(443),
            None => None,
        };

        let path_and_query = pseudo.path.ok_or_else(|| message_error("missing :path"))?;
        if path_and_query.path().is_empty() {
            return Err(message_error("empty :path"));
        }
        let path = path_and_query.path().to_string();
        let qs = path_and_query.query().unwrap_or("").to_string();

        Ok(Request {
            transport: TransportKind::Quic,
            stream: id,
            reply: StreamSender {
                tx: self.tx.clone(),
                id,
            },
            peer: self.peer,
            local: self.local,
            method,
            scheme,
            host,
            port,
            path,
            qs,
            version: Version::HTTP_3,
            headers: fold_headers(fields)?,
            has_body: !is_fin.is_fin(),
            body_length: body_len,
        })
    }

    fn data_event(&mut self, id: StreamId, fin: Fin, chunk: Bytes) -> Result<(), Reason> {
        let Some(mut state) = self.streams.get_mut(&id).and_then(|s| s.state.take()) else {
            warn!("body data on {id} with no handler");
            return Ok(());
        };
        let handler = self.handler.clone();
        let result = catch_unwind(AssertUnwindSafe(|| handler.data(id, fin, chunk, &mut state)));
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.state = Some(state);
        }
        match result {
            Ok(commands) => self.run_commands(id, commands),
            Err(payload) => {
                self.handler_crashed("data", id, payload.as_ref());
                Ok(())
            }
        }
    }

    fn on_stream_message(&mut self, id: StreamId, msg: Box<dyn Any + Send>) -> Result<(), Reason> {
        if !self.streams.contains_key(&id) {
            if self.lingering.contains(id) {
                trace!("message for lingering {id}");
            } else {
                warn!("message for unknown {id}");
            }
            return Ok(());
        }
        self.handler_info(id, InfoMsg::Message(msg))
    }

    fn handler_info(&mut self, id: StreamId, msg: InfoMsg) -> Result<(), Reason> {
        let Some(mut state) = self.streams.get_mut(&id).and_then(|s| s.state.take()) else {
            warn!("message for {id}, which has no handler");
            return Ok(());
        };
        let handler = self.handler.clone();
        let result = catch_unwind(AssertUnwindSafe(|| handler.info(id, msg, &mut state)));
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.state = Some(state);
        }
        match result {
            Ok(commands) => self.run_commands(id, commands),
            Err(payload) => {
                self.handler_crashed("info", id, payload.as_ref());
                Ok(())
            }
        }
    }

    fn on_child_down(&mut self, id: ChildId, exit: ChildExit) -> Result<(), Reason> {
        match self.children.down(id) {
            // The owning stream already terminated.
            Down::Known(None) => Ok(()),
            Down::Known(Some(stream)) => {
                if !self.streams.contains_key(&stream) {
                    if !self.lingering.contains(stream) {
                        warn!("{id} exited for unknown {stream}");
                    }
                    return Ok(());
                }
                self.handler_info(stream, InfoMsg::ChildExit { child: id, exit })
            }
            Down::Unknown => {
                warn!("exit notification from unsupervised {id}");
                Ok(())
            }
        }
    }

    fn on_stream_closed(&mut self, id: StreamId) -> Result<(), Reason> {
        self.machine.close_stream(id).map_err(Reason::from)?;
        self.terminate_stream(id, Reason::Normal);
        Ok(())
    }

    /// Execute handler commands in order. Stops early if a command ends
    /// the stream.
    fn run_commands(&mut self, id: StreamId, commands: Commands) -> Result<(), Reason> {
        for command in commands {
            if !self.streams.contains_key(&id) {
                return Ok(());
            }
            match command {
                Command::Inform(status, headers) => {
                    self.send_headers(id, status, headers, Fin::NoFin)?;
                }
                Command::Response(status, headers, body) => {
                    self.send_response(id, status, headers, body)?;
                }
                Command::Headers(status, headers) => {
                    self.send_headers(id, status, headers, Fin::NoFin)?;
                }
                Command::Data(fin, body) => {
                    self.send_data(id, fin, body)?;
                }
                Command::Trailers(trailers) => {
                    self.send_trailers(id, trailers)?;
                }
                Command::Flow(n) => {
                    // TODO: grow the QUIC receive window by n once the
                    // transport contract exposes it.
                    trace!("flow({n}) on {id} ignored");
                }
                Command::Spawn(spec) => self.spawn_child(id, spec),
                Command::SetOptions(_) => {}
                Command::Log(entry) => log_command(id, entry),
                Command::Stop => {
                    self.stop_stream(id)?;
                }
                Command::ErrorResponse(status, headers, body) => {
                    if self.machine.get_stream_local_state(id) == Some(LocalState::Idle) {
                        self.send_response(id, status, headers, body)?;
                    } else {
                        debug!("error response on {id} dropped, response already sent");
                    }
                }
                Command::Push(_) => {
                    debug!("push on {id} ignored, server push is not implemented");
                }
            }
        }
        Ok(())
    }

    fn send_headers(
        &mut self,
        id: StreamId,
        status: StatusCode,
        headers: HeaderMap,
        fin: Fin,
    ) -> Result<(), Reason> {
        let prepared = match self.machine.prepare_headers(id, fin, Header::response(status, headers)) {
            Ok(prepared) => prepared,
            Err(MachineError::Stream(code, reason)) => {
                self.reset_stream(id, Reason::StreamError(code, reason));
                return Ok(());
            }
            Err(e) => return Err(Reason::from(e)),
        };
        self.write_header_block(id, prepared.block, prepared.encoder_data, fin);
        Ok(())
    }

    /// Write a HEADERS frame, flushing any QPACK encoder instructions it
    /// depends on first.
    fn write_header_block(&mut self, id: StreamId, block: Bytes, encoder_data: Bytes, fin: Fin) {
        if !encoder_data.is_empty() {
            self.side_write(self.local_encoder, encoder_data);
        }
        let mut head = BytesMut::with_capacity(Frame::MAX_ENCODED_SIZE);
        Frame::Headers(block.clone()).encode(&mut head);
        let mut buf = WriteBuf::new();
        buf.push(head.freeze());
        buf.push(block);
        self.send(id, buf, fin.into());
    }

    fn send_response(
        &mut self,
        id: StreamId,
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
    ) -> Result<(), Reason> {
        if body.is_empty() {
            return self.send_headers(id, status, headers, Fin::Fin);
        }
        match body {
            // Headers and body go out in a single transport write.
            Body::Full(bytes) => {
                let prepared = match self
                    .machine
                    .prepare_headers(id, Fin::NoFin, Header::response(status, headers))
                {
                    Ok(prepared) => prepared,
                    Err(MachineError::Stream(code, reason)) => {
                        self.reset_stream(id, Reason::StreamError(code, reason));
                        return Ok(());
                    }
                    Err(e) => return Err(Reason::from(e)),
                };
                self.machine.close_bidi_stream_for_sending(id);
                let PreparedHeaders {
                    block, encoder_data, ..
                } = prepared;
                if !encoder_data.is_empty() {
                    self.side_write(self.local_encoder, encoder_data);
                }
                let mut head = BytesMut::with_capacity(Frame::MAX_ENCODED_SIZE);
                Frame::Headers(block.clone()).encode(&mut head);
                let mut buf = WriteBuf::new();
                buf.push(head.freeze());
                buf.push(block);
                let mut data_head = BytesMut::with_capacity(Frame::MAX_ENCODED_SIZE);
                Frame::Data(bytes.clone()).encode(&mut data_head);
                buf.push(data_head.freeze());
                buf.push(bytes);
                self.send(id, buf, SendFlag::Fin);
                Ok(())
            }
            Body::Sendfile { path, offset, len } => {
                self.send_headers(id, status, headers, Fin::NoFin)?;
                if !self.streams.contains_key(&id) {
                    return Ok(());
                }
                self.send_data(id, Fin::Fin, Body::Sendfile { path, offset, len })
            }
        }
    }

    fn send_data(&mut self, id: StreamId, fin: Fin, body: Body) -> Result<(), Reason> {
        match body {
            Body::Full(bytes) => {
                let mut head = BytesMut::with_capacity(Frame::MAX_ENCODED_SIZE);
                Frame::Data(bytes.clone()).encode(&mut head);
                let mut buf = WriteBuf::new();
                buf.push(head.freeze());
                buf.push(bytes);
                self.send(id, buf, fin.into());
            }
            Body::Sendfile { path, offset, len } => {
                // One DATA frame worth of file bytes, then an empty DATA
                // frame carries the fin.
                self.send(id, WriteBuf::from(data_frame_header(len)), SendFlag::None);
                if let Err(e) = self.transport.sendfile(id, &path, offset, len) {
                    warn!("sendfile on {id} failed: {e}");
                }
                if fin.is_fin() {
                    self.send(id, WriteBuf::from(data_frame_header(0)), SendFlag::Fin);
                }
            }
        }
        if fin.is_fin() {
            self.machine.close_bidi_stream_for_sending(id);
        }
        Ok(())
    }

    fn send_trailers(&mut self, id: StreamId, trailers: HeaderMap) -> Result<(), Reason> {
        match self.machine.prepare_trailers(id, trailers) {
            Ok(PreparedTrailers::Trailers { block, encoder_data }) => {
                self.write_header_block(id, block, encoder_data, Fin::Fin);
                Ok(())
            }
            Ok(PreparedTrailers::NoTrailers) => self.send_data(id, Fin::Fin, Body::empty()),
            Err(MachineError::Stream(code, reason)) => {
                self.reset_stream(id, Reason::StreamError(code, reason));
                Ok(())
            }
            Err(e) => Err(Reason::from(e)),
        }
    }

    fn spawn_child(&mut self, id: StreamId, spec: ChildSpec) {
        let ChildSpec { handle, shutdown } = spec;
        let child = self.children.register(id, handle.abort_handle(), shutdown);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let exit = match handle.await {
                Ok(()) => ChildExit::Normal,
                Err(e) if e.is_cancelled() => ChildExit::Killed,
                Err(_) => ChildExit::Panic,
            };
            let _ = tx.send(Event::ChildDown { id: child, exit });
        });
    }

    /// A handler voluntarily ends its stream: complete the response if
    /// one is owed, stop reading, and terminate.
    fn stop_stream(&mut self, id: StreamId) -> Result<(), Reason> {
        if self.machine.get_stream_remote_state(id) != Some(RemoteState::Fin) {
            self.transport
                .shutdown_stream(id, ShutdownFlag::AbortReceive, Code::H3_NO_ERROR.value());
            self.set_status(id, Status::Discard);
        }
        match self.machine.get_stream_local_state(id) {
            Some(LocalState::Idle) => {
                self.send_headers(id, StatusCode::NO_CONTENT, HeaderMap::new(), Fin::Fin)?;
            }
            Some(LocalState::NoFin) => {
                self.send_data(id, Fin::Fin, Body::empty())?;
            }
            _ => {}
        }
        self.terminate_stream(id, Reason::Normal);
        Ok(())
    }

    /// Abort both halves of a stream with an error code and tear it down.
    fn reset_stream(&mut self, id: StreamId, reason: Reason) {
        self.transport
            .shutdown_stream(id, ShutdownFlag::Abort, reason.code().value());
        self.machine.reset_stream(id);
        self.terminate_stream(id, reason);
    }

    fn terminate_stream(&mut self, id: StreamId, reason: Reason) {
        let Some(stream) = self.streams.remove(&id) else {
            return;
        };
        if let Some(state) = stream.state {
            let handler = self.handler.clone();
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| handler.terminate(id, &reason, state)))
            {
                error!(
                    "{}",
                    self.handler.make_error_log("terminate", id, panic_message(payload.as_ref()))
                );
            }
        }
        self.children.shutdown(id);
        self.lingering.push(id);
    }

    fn handler_crashed(&mut self, op: &'static str, id: StreamId, payload: &(dyn Any + Send)) {
        let detail = panic_message(payload);
        error!("{}", self.handler.make_error_log(op, id, detail));
        self.reset_stream(
            id,
            Reason::InternalError(format!("stream handler crashed in {op}: {detail}")),
        );
    }

    fn terminate_connection(&mut self, reason: &Reason) {
        debug!("connection from {} terminating: {reason}", self.peer);
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            self.terminate_stream(id, reason.clone());
        }
        self.children.terminate_all();
        self.transport
            .shutdown_connection(ShutdownFlag::Abort, reason.code().value());
    }

    fn send(&mut self, id: StreamId, buf: WriteBuf, flag: SendFlag) {
        if let Err(e) = self.transport.send(id, buf, flag) {
            // Not fatal by itself: if the connection is really gone the
            // transport delivers a closed event next.
            warn!("transport send on {id} failed: {e}");
        }
    }

    fn side_write(&mut self, id: StreamId, data: Bytes) {
        self.send(id, WriteBuf::from(data), SendFlag::None);
    }
}

/// Fold duplicate request headers into single values: `", "`-separated,
/// except `cookie` which concatenates with `"; "` (RFC 9114, section
/// 4.2.1).
fn fold_headers(fields: HeaderMap) -> Result<HeaderMap, Reason> {
    let mut folded = HeaderMap::with_capacity(fields.keys_len());
    let keys: Vec<HeaderName> = fields.keys().cloned().collect();
    for key in keys {
        let mut values = fields.get_all(&key).iter();
        let Some(first) = values.next() else { continue };
        let rest: Vec<&HeaderValue> = values.collect();
        let value = if rest.is_empty() {
            first.clone()
        } else {
            let sep: &[u8] = if key == header::COOKIE { b"; " } else { b", " };
            let mut joined = BytesMut::from(first.as_bytes());
            for value in rest {
                joined.extend_from_slice(sep);
                joined.extend_from_slice(value.as_bytes());
            }
            HeaderValue::from_maybe_shared(joined.freeze())
                .map_err(|_| message_error("invalid folded header value"))?
        };
        folded.insert(key, value);
    }
    Ok(folded)
}

fn log_command(id: StreamId, entry: LogEntry) {
    let LogEntry { level, message } = entry;
    if level == Level::ERROR {
        error!("{id}: {message}");
    } else if level == Level::WARN {
        warn!("{id}: {message}");
    } else if level == Level::INFO {
        info!("{id}: {message}");
    } else if level == Level::DEBUG {
        debug!("{id}: {message}");
    } else {
        trace!("{id}: {message}");
    }
}

fn stream_type_byte(ty: StreamType) -> Bytes {
    let mut buf = BytesMut::with_capacity(StreamType::MAX_ENCODED_SIZE);
    ty.encode(&mut buf);
    buf.freeze()
}

fn data_frame_header(len: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(Frame::MAX_ENCODED_SIZE);
    FrameType::DATA.encode(&mut buf);
    write_varint(&mut buf, len);
    buf.freeze()
}

fn message_error(reason: &'static str) -> Reason {
    Reason::StreamError(Code::H3_MESSAGE_ERROR, Cow::Borrowed(reason))
}

fn truncated_frame() -> Reason {
    Reason::ConnectionError(
        Code::H3_FRAME_ERROR,
        Cow::Borrowed("last frame on stream was truncated"),
    )
}

fn socket_error(op: &'static str, e: &dyn std::error::Error) -> Error {
    Error::from(Reason::SocketError(Cow::Owned(format!("{op}: {e}"))))
}
