//! The server-side HTTP/3 protocol state machine.
//!
//! The machine owns everything RFC 9114 says about frame legality and
//! message sequencing, but nothing about I/O: callers feed it decoded
//! frames and it hands back events, header blocks to write, and QPACK
//! side-channel bytes to flush. Side-channel writes are always surfaced to
//! the caller so stream writes and their dependent instruction writes can
//! be ordered deterministically.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tracing::{trace, warn};

use drover_codec::error::Code;
use drover_codec::frame::Frame;
use drover_codec::headers::Header;
use drover_codec::qpack;
use drover_codec::settings::{SettingId, Settings};
use drover_codec::stream::{Fin, StreamId};
use drover_codec::varint::VarInt;

/// Which role this endpoint plays on the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
}

/// Protocol-level knobs, owned by the machine once initialized.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest field section this endpoint accepts, advertised in
    /// SETTINGS.
    pub max_field_section_size: u64,
    /// Whether to add a GREASE entry to the SETTINGS frame.
    pub send_grease: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_field_section_size: VarInt::MAX.into_inner(),
            send_grease: true,
        }
    }
}

/// The classified type of a peer-opened unidirectional stream the machine
/// tracks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnidiKind {
    Control,
    Encoder,
    Decoder,
}

/// Local (send) state of a bidirectional stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LocalState {
    /// No response headers sent yet.
    Idle,
    /// Final response headers sent, stream not finished.
    NoFin,
    /// Send side complete.
    Fin,
}

/// Remote (receive) state of a bidirectional stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RemoteState {
    /// Awaiting request headers.
    Idle,
    /// Inside the message body.
    Body,
    /// Trailers received, fin still outstanding.
    Trailers,
    /// Receive side complete.
    Fin,
}

#[derive(Debug)]
struct StreamState {
    local: LocalState,
    remote: RemoteState,
    expected_len: Option<u64>,
    received_len: u64,
}

impl StreamState {
    fn new() -> Self {
        Self {
            local: LocalState::Idle,
            remote: RemoteState::Idle,
            expected_len: None,
            received_len: 0,
        }
    }
}

/// What a processed frame means for the connection core.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Bookkeeping only, nothing to surface.
    Processed,
    /// A body chunk for the stream's handler.
    Data(Bytes),
    /// A complete request head.
    Headers(HeadersEvent),
    /// A trailer section ending the message body.
    Trailers(HeaderMap),
    /// The peer is going away.
    GoAway(StreamId),
}

/// A decoded HEADERS frame on a request stream.
#[derive(Debug)]
pub struct HeadersEvent {
    pub is_fin: Fin,
    pub header: Header,
    /// Declared `content-length`, if any.
    pub body_len: Option<u64>,
    /// Bytes to write on the local decoder stream before acting on the
    /// event. Always `None` for the stateless codec, but surfaced so the
    /// caller owns the write ordering.
    pub decoder_data: Option<Bytes>,
}

/// A prepared outgoing header section.
#[derive(Debug)]
pub struct PreparedHeaders {
    pub is_fin: Fin,
    pub block: Bytes,
    /// Bytes to write on the local encoder stream no later than the
    /// HEADERS frame itself. Empty for the stateless codec.
    pub encoder_data: Bytes,
}

/// Outcome of preparing outgoing trailers.
#[derive(Debug)]
pub enum PreparedTrailers {
    /// Send this block as a HEADERS frame with fin.
    Trailers { block: Bytes, encoder_data: Bytes },
    /// Nothing to send; finish with an empty DATA frame instead.
    NoTrailers,
}

/// A protocol violation, scoped to one stream or to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    Stream(Code, Cow<'static, str>),
    Connection(Code, Cow<'static, str>),
}

impl std::error::Error for MachineError {}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(code, reason) => write!(f, "stream error {code:?}: {reason}"),
            Self::Connection(code, reason) => write!(f, "connection error {code:?}: {reason}"),
        }
    }
}

/// The per-connection protocol state.
#[derive(Debug)]
pub struct Machine {
    max_field_section_size: u64,
    peer_settings_received: bool,
    peer_max_field_section_size: u64,
    local_control: Option<StreamId>,
    local_encoder: Option<StreamId>,
    local_decoder: Option<StreamId>,
    remote_control: Option<StreamId>,
    remote_encoder: Option<StreamId>,
    remote_decoder: Option<StreamId>,
    streams: HashMap<StreamId, StreamState>,
    ignored_frames: u64,
}

impl Machine {
    /// Initialize server state and produce the SETTINGS frame that must be
    /// the first write on the local control stream.
    pub fn init(_role: Role, config: &Config) -> (Bytes, Self) {
        let mut settings = Settings::default();
        settings
            .insert(SettingId::MAX_HEADER_LIST_SIZE, config.max_field_section_size)
            .expect("fresh settings");
        if config.send_grease {
            if let Err(err) = settings.insert(SettingId::grease(), 0) {
                warn!("could not add grease setting: {err}");
            }
        }
        let mut buf = BytesMut::with_capacity(Settings::MAX_ENCODED_SIZE);
        settings.encode(&mut buf);

        let machine = Self {
            max_field_section_size: config.max_field_section_size,
            peer_settings_received: false,
            peer_max_field_section_size: VarInt::MAX.into_inner(),
            local_control: None,
            local_encoder: None,
            local_decoder: None,
            remote_control: None,
            remote_encoder: None,
            remote_decoder: None,
            streams: HashMap::new(),
            ignored_frames: 0,
        };
        (buf.freeze(), machine)
    }

    /// Register the locally opened control/encoder/decoder trio.
    pub fn init_unidi_local_streams(&mut self, control: StreamId, encoder: StreamId, decoder: StreamId) {
        self.local_control = Some(control);
        self.local_encoder = Some(encoder);
        self.local_decoder = Some(decoder);
    }

    /// The locally opened control/encoder/decoder streams, once
    /// registered.
    pub fn local_unidi_streams(&self) -> Option<(StreamId, StreamId, StreamId)> {
        Some((self.local_control?, self.local_encoder?, self.local_decoder?))
    }

    /// Track a peer-opened bidirectional (request) stream.
    pub fn init_bidi_stream(&mut self, id: StreamId) {
        self.streams.insert(id, StreamState::new());
    }

    /// Track a peer-opened unidirectional stream whose type tag has not
    /// arrived yet.
    pub fn init_unidi_stream(&mut self, id: StreamId) {
        self.streams.insert(id, StreamState::new());
    }

    /// Record the type of a peer unidirectional stream. Only one of each
    /// critical kind is permitted (RFC 9114, section 6.2).
    pub fn set_unidi_remote_stream_type(&mut self, id: StreamId, kind: UnidiKind) -> Result<(), MachineError> {
        let slot = match kind {
            UnidiKind::Control => &mut self.remote_control,
            UnidiKind::Encoder => &mut self.remote_encoder,
            UnidiKind::Decoder => &mut self.remote_decoder,
        };
        if slot.replace(id).is_some() {
            return Err(MachineError::Connection(
                Code::H3_STREAM_CREATION_ERROR,
                match kind {
                    UnidiKind::Control => Cow::Borrowed("got two control streams"),
                    UnidiKind::Encoder => Cow::Borrowed("got two encoder streams"),
                    UnidiKind::Decoder => Cow::Borrowed("got two decoder streams"),
                },
            ));
        }
        Ok(())
    }

    /// The registered kind of a remote unidirectional stream, if any.
    pub fn unidi_kind(&self, id: StreamId) -> Option<UnidiKind> {
        if self.remote_control == Some(id) {
            Some(UnidiKind::Control)
        } else if self.remote_encoder == Some(id) {
            Some(UnidiKind::Encoder)
        } else if self.remote_decoder == Some(id) {
            Some(UnidiKind::Decoder)
        } else {
            None
        }
    }

    /// Feed bytes of a QPACK side stream. Returns the trailing partial
    /// instruction, to be buffered by the caller.
    pub fn qpack_stream_data(&mut self, kind: UnidiKind, data: Bytes) -> Result<Bytes, MachineError> {
        let mut buf = data;
        match kind {
            UnidiKind::Encoder => qpack::exec_encoder_instructions(&mut buf).map_err(|e| {
                MachineError::Connection(Code::QPACK_ENCODER_STREAM_ERROR, e.to_string().into())
            })?,
            UnidiKind::Decoder => qpack::exec_decoder_instructions(&mut buf).map_err(|e| {
                MachineError::Connection(Code::QPACK_DECODER_STREAM_ERROR, e.to_string().into())
            })?,
            UnidiKind::Control => {}
        }
        Ok(buf)
    }

    /// Apply one decoded frame.
    pub fn frame(&mut self, frame: Frame, is_fin: Fin, id: StreamId) -> Result<FrameOutcome, MachineError> {
        if self.remote_control == Some(id) {
            self.control_frame(frame)
        } else {
            self.request_frame(frame, is_fin, id)
        }
    }

    fn control_frame(&mut self, frame: Frame) -> Result<FrameOutcome, MachineError> {
        match frame {
            Frame::Settings(settings) if !self.peer_settings_received => {
                self.peer_settings_received = true;
                self.peer_max_field_section_size = settings
                    .get(SettingId::MAX_HEADER_LIST_SIZE)
                    .unwrap_or_else(|| VarInt::MAX.into_inner());
                trace!("peer settings received");
                Ok(FrameOutcome::Processed)
            }
            Frame::Settings(_) => Err(MachineError::Connection(
                Code::H3_FRAME_UNEXPECTED,
                Cow::Borrowed("second SETTINGS frame on control stream"),
            )),
            // The first frame of the control stream must be SETTINGS
            // (RFC 9114, section 6.2.1).
            frame if !self.peer_settings_received => Err(MachineError::Connection(
                Code::H3_MISSING_SETTINGS,
                Cow::Owned(format!("received {frame:?} before settings on control stream")),
            )),
            Frame::Goaway(id) => Ok(FrameOutcome::GoAway(id)),
            frame @ (Frame::CancelPush(_) | Frame::MaxPushId(_)) => {
                trace!("control frame ignored: {:?}", frame);
                Ok(FrameOutcome::Processed)
            }
            frame => Err(MachineError::Connection(
                Code::H3_FRAME_UNEXPECTED,
                Cow::Owned(format!("on control stream: {frame:?}")),
            )),
        }
    }

    fn request_frame(&mut self, frame: Frame, is_fin: Fin, id: StreamId) -> Result<FrameOutcome, MachineError> {
        match frame {
            Frame::Headers(mut block) => {
                let max = self.max_field_section_size;
                let state = self.stream_mut(id)?;
                match state.remote {
                    RemoteState::Idle => {
                        let header = decode_header(&mut block, max)?;
                        let body_len = content_length(&header.fields)?;
                        if is_fin.is_fin() && body_len.unwrap_or(0) != 0 {
                            return Err(MachineError::Stream(
                                Code::H3_MESSAGE_ERROR,
                                Cow::Borrowed("content-length promised a body on a finished stream"),
                            ));
                        }
                        let state = self.stream_mut(id)?;
                        state.expected_len = body_len;
                        state.remote = if is_fin.is_fin() { RemoteState::Fin } else { RemoteState::Body };
                        Ok(FrameOutcome::Headers(HeadersEvent {
                            is_fin,
                            header,
                            body_len,
                            decoder_data: None,
                        }))
                    }
                    RemoteState::Body => {
                        if let Some(expected) = state.expected_len {
                            if state.received_len != expected {
                                return Err(MachineError::Stream(
                                    Code::H3_MESSAGE_ERROR,
                                    Cow::Borrowed("body ended short of content-length"),
                                ));
                            }
                        }
                        let header = decode_header(&mut block, max)?;
                        if header.pseudo.any() {
                            return Err(MachineError::Stream(
                                Code::H3_MESSAGE_ERROR,
                                Cow::Borrowed("pseudo-header field in trailers"),
                            ));
                        }
                        let state = self.stream_mut(id)?;
                        state.remote = if is_fin.is_fin() { RemoteState::Fin } else { RemoteState::Trailers };
                        Ok(FrameOutcome::Trailers(header.into_fields()))
                    }
                    RemoteState::Trailers | RemoteState::Fin => Err(MachineError::Connection(
                        Code::H3_FRAME_UNEXPECTED,
                        Cow::Borrowed("HEADERS after end of message"),
                    )),
                }
            }
            Frame::Data(chunk) => {
                let state = self.stream_mut(id)?;
                match state.remote {
                    // DATA must follow HEADERS (RFC 9114, section 4.1).
                    RemoteState::Idle => Err(MachineError::Connection(
                        Code::H3_FRAME_UNEXPECTED,
                        Cow::Borrowed("DATA frame before HEADERS"),
                    )),
                    RemoteState::Body => {
                        state.received_len += chunk.len() as u64;
                        if let Some(expected) = state.expected_len {
                            if state.received_len > expected {
                                return Err(MachineError::Stream(
                                    Code::H3_MESSAGE_ERROR,
                                    Cow::Borrowed("DATA payload exceeds content-length"),
                                ));
                            }
                            if is_fin.is_fin() && state.received_len != expected {
                                return Err(MachineError::Stream(
                                    Code::H3_MESSAGE_ERROR,
                                    Cow::Borrowed("body ended short of content-length"),
                                ));
                            }
                        }
                        if is_fin.is_fin() {
                            state.remote = RemoteState::Fin;
                        }
                        Ok(FrameOutcome::Data(chunk))
                    }
                    RemoteState::Trailers | RemoteState::Fin => Err(MachineError::Connection(
                        Code::H3_FRAME_UNEXPECTED,
                        Cow::Borrowed("DATA after end of message"),
                    )),
                }
            }
            // A server never accepts pushes; promises are skipped like
            // reserved frames.
            Frame::PushPromise(_) => {
                self.ignored_frames += 1;
                Ok(FrameOutcome::Processed)
            }
            frame => Err(MachineError::Connection(
                Code::H3_FRAME_UNEXPECTED,
                Cow::Owned(format!("on request stream: {frame:?}")),
            )),
        }
    }

    /// Bookkeeping for a reserved or unknown frame skipped by the parser.
    pub fn ignored_frame(&mut self, id: StreamId) {
        trace!("ignored frame on {id}");
        self.ignored_frames += 1;
    }

    /// Encode a header section for sending and advance the stream's local
    /// state.
    pub fn prepare_headers(&mut self, id: StreamId, is_fin: Fin, header: Header) -> Result<PreparedHeaders, MachineError> {
        let peer_max = self.peer_max_field_section_size;
        let informational = header.is_informational();
        let mut block = BytesMut::new();
        let mem_size = qpack::encode_stateless(&mut block, header);
        // The peer told us how big a section it will accept (RFC 9114,
        // section 4.2.2).
        if mem_size > peer_max {
            return Err(MachineError::Stream(
                Code::H3_INTERNAL_ERROR,
                Cow::Owned(format!("header section of {mem_size} bytes exceeds peer's limit {peer_max}")),
            ));
        }
        let state = self.stream_mut(id)?;
        if !informational {
            state.local = if is_fin.is_fin() { LocalState::Fin } else { LocalState::NoFin };
        }
        Ok(PreparedHeaders {
            is_fin,
            block: block.freeze(),
            encoder_data: Bytes::new(),
        })
    }

    /// Encode a trailer section, or report that an empty DATA frame should
    /// end the stream instead. Either way the local side is finished.
    pub fn prepare_trailers(&mut self, id: StreamId, trailers: HeaderMap) -> Result<PreparedTrailers, MachineError> {
        let state = self.stream_mut(id)?;
        state.local = LocalState::Fin;
        if trailers.is_empty() {
            return Ok(PreparedTrailers::NoTrailers);
        }
        let mut block = BytesMut::new();
        qpack::encode_stateless(&mut block, Header::trailer(trailers));
        Ok(PreparedTrailers::Trailers {
            block: block.freeze(),
            encoder_data: Bytes::new(),
        })
    }

    /// Record that the local send side is complete.
    pub fn close_bidi_stream_for_sending(&mut self, id: StreamId) {
        if let Some(state) = self.streams.get_mut(&id) {
            state.local = LocalState::Fin;
        }
    }

    /// Forget a stream that the transport reported closed. Closing a
    /// critical stream kills the connection (RFC 9114, section 6.2.1).
    pub fn close_stream(&mut self, id: StreamId) -> Result<(), MachineError> {
        self.streams.remove(&id);
        if self.remote_control == Some(id) || self.remote_encoder == Some(id) || self.remote_decoder == Some(id) {
            return Err(MachineError::Connection(
                Code::H3_CLOSED_CRITICAL_STREAM,
                Cow::Borrowed("critical stream closed"),
            ));
        }
        Ok(())
    }

    /// Forget a stream that was reset.
    pub fn reset_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    pub fn get_stream_local_state(&self, id: StreamId) -> Option<LocalState> {
        self.streams.get(&id).map(|s| s.local)
    }

    pub fn get_stream_remote_state(&self, id: StreamId) -> Option<RemoteState> {
        self.streams.get(&id).map(|s| s.remote)
    }

    /// The peer's advertised field section limit.
    pub fn peer_max_field_section_size(&self) -> u64 {
        self.peer_max_field_section_size
    }

    /// How many frames were skipped without semantic effect.
    pub fn ignored_frames(&self) -> u64 {
        self.ignored_frames
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut StreamState, MachineError> {
        self.streams.get_mut(&id).ok_or(MachineError::Connection(
            Code::H3_INTERNAL_ERROR,
            Cow::Borrowed("operation on untracked stream"),
        ))
    }
}

fn decode_header(block: &mut Bytes, max: u64) -> Result<Header, MachineError> {
    let decoded = qpack::decode_stateless(block, max).map_err(|e| match e {
        qpack::DecoderError::HeaderTooLong(size) => MachineError::Stream(
            Code::H3_EXCESSIVE_LOAD,
            Cow::Owned(format!("field section of {size} bytes exceeds limit")),
        ),
        e => MachineError::Connection(Code::QPACK_DECOMPRESSION_FAILED, e.to_string().into()),
    })?;
    Header::try_from(decoded.fields)
        .map_err(|e| MachineError::Stream(Code::H3_MESSAGE_ERROR, e.to_string().into()))
}

/// All `content-length` values must agree and parse (RFC 9110 via RFC
/// 9114, section 4.1.2).
fn content_length(fields: &HeaderMap) -> Result<Option<u64>, MachineError> {
    let mut result = None;
    for value in fields.get_all(http::header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(MachineError::Stream(
                Code::H3_MESSAGE_ERROR,
                Cow::Borrowed("invalid content-length"),
            ))?;
        match result {
            None => result = Some(parsed),
            Some(prev) if prev == parsed => {}
            Some(_) => {
                return Err(MachineError::Stream(
                    Code::H3_MESSAGE_ERROR,
                    Cow::Borrowed("conflicting content-length values"),
                ));
            }
        }
    }
    Ok(result)
}
