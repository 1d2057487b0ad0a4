//! HTTP/3 frame parsing.
//!
//! The parser works on whatever slice of a stream the transport delivered
//! so far. DATA frames are never materialized: the parser stops at the
//! framing header ([`Parsed::DataHeader`]) and the caller streams the body
//! to its consumer chunk by chunk.

use std::fmt;

use bytes::{Buf, Bytes};
use tracing::trace;

use crate::error::Code;
use crate::settings::{Settings, SettingsError};
use crate::stream::{InvalidStreamId, StreamId};
use crate::varint::{read_varint, write_varint, UnexpectedEnd, VarInt};

/// Result of parsing the front of a stream buffer.
#[derive(Debug)]
pub enum Parsed {
    /// A complete frame, and the bytes that follow it.
    Frame(Frame, Bytes),
    /// A DATA framing header: `len` payload bytes follow on the wire,
    /// starting with `rest` (possibly empty, possibly past the payload).
    DataHeader { len: u64, rest: Bytes },
    /// A reserved or unknown frame, skipped entirely; the bytes after it.
    Ignored(Bytes),
    /// Not enough bytes for a complete frame yet.
    More,
}

/// A single HTTP/3 frame. DATA payloads are not carried here on the parse
/// path; [`Frame::Data`] exists for body chunk accounting and for encoding
/// framing headers.
pub enum Frame {
    Data(Bytes),
    Headers(Bytes),
    CancelPush(u64),
    Settings(Settings),
    PushPromise(Bytes),
    Goaway(StreamId),
    MaxPushId(u64),
}

impl Frame {
    pub const MAX_ENCODED_SIZE: usize = VarInt::MAX_SIZE * 3;

    /// Encode the framing header. HEADERS and DATA payloads are written
    /// by the caller, after the header, so that payload bytes can be
    /// chained into the same transport write without copying.
    pub fn encode<T: bytes::BufMut>(&self, buf: &mut T) {
        match self {
            Self::Data(b) => {
                FrameType::DATA.encode(buf);
                write_varint(buf, b.len() as u64);
            }
            Self::Headers(f) => {
                FrameType::HEADERS.encode(buf);
                write_varint(buf, f.len() as u64);
            }
            Self::Settings(f) => f.encode(buf),
            Self::PushPromise(f) => {
                FrameType::PUSH_PROMISE.encode(buf);
                write_varint(buf, f.len() as u64);
            }
            Self::CancelPush(id) => simple_frame_encode(FrameType::CANCEL_PUSH, *id, buf),
            Self::Goaway(id) => simple_frame_encode(FrameType::GOAWAY, id.value(), buf),
            Self::MaxPushId(id) => simple_frame_encode(FrameType::MAX_PUSH_ID, *id, buf),
        }
    }
}

/// Decode one frame from the front of `data`.
pub fn parse(data: Bytes) -> Result<Parsed, FrameError> {
    let mut buf = data;
    let Ok(ty) = FrameType::decode(&mut buf) else {
        return Ok(Parsed::More);
    };
    let Ok(len) = read_varint(&mut buf) else {
        return Ok(Parsed::More);
    };

    if ty == FrameType::DATA {
        return Ok(Parsed::DataHeader { len, rest: buf });
    }
    if (buf.remaining() as u64) < len {
        return Ok(Parsed::More);
    }

    let mut payload = buf.split_to(len as usize);
    let frame = match ty {
        FrameType::HEADERS => Frame::Headers(payload),
        FrameType::SETTINGS => Frame::Settings(Settings::decode(&mut payload)?),
        FrameType::CANCEL_PUSH => Frame::CancelPush(payload_var(&mut payload)?),
        FrameType::PUSH_PROMISE => Frame::PushPromise(payload),
        FrameType::GOAWAY => {
            Frame::Goaway(StreamId::try_from(payload_var(&mut payload)?)?)
        }
        FrameType::MAX_PUSH_ID => Frame::MaxPushId(payload_var(&mut payload)?),
        FrameType::H2_PRIORITY | FrameType::H2_PING | FrameType::H2_WINDOW_UPDATE | FrameType::H2_CONTINUATION => {
            return Err(FrameError::UnsupportedFrame(ty.0));
        }
        _ => {
            trace!("ignore unknown frame type {:#x}", ty.0);
            return Ok(Parsed::Ignored(buf));
        }
    };
    Ok(Parsed::Frame(frame, buf))
}

/// A frame payload that is a single varint must contain exactly that
/// varint (RFC 9114, section 7.1).
fn payload_var(payload: &mut Bytes) -> Result<u64, FrameError> {
    let value = read_varint(payload).map_err(|_| FrameError::Malformed)?;
    if payload.has_remaining() {
        return Err(FrameError::Malformed);
    }
    Ok(value)
}

/// The classification of a peer-opened unidirectional stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnidiType {
    Control,
    Encoder,
    Decoder,
    Push,
    Unknown(u64),
}

/// Read the type tag off the front of a unidirectional stream. `None`
/// means the tag is not complete yet.
pub fn parse_unidi_stream_header(data: Bytes) -> Option<(UnidiType, Bytes)> {
    let mut buf = data;
    let ty = VarInt::decode(&mut buf).ok()?;
    let ty = match ty.into_inner() {
        0x00 => UnidiType::Control,
        0x01 => UnidiType::Push,
        0x02 => UnidiType::Encoder,
        0x03 => UnidiType::Decoder,
        other => UnidiType::Unknown(other),
    };
    Some((ty, buf))
}

fn simple_frame_encode<B: bytes::BufMut>(ty: FrameType, id: u64, buf: &mut B) {
    ty.encode(buf);
    write_varint(buf, VarInt::from_u64(id).expect("id out of varint range").size() as u64);
    write_varint(buf, id);
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(data) => write!(f, "Data({} bytes)", data.len()),
            Self::Headers(block) => write!(f, "Headers({} bytes)", block.len()),
            Self::Settings(_) => write!(f, "Settings"),
            Self::CancelPush(id) => write!(f, "CancelPush({id})"),
            Self::PushPromise(block) => write!(f, "PushPromise({} bytes)", block.len()),
            Self::Goaway(id) => write!(f, "GoAway({id})"),
            Self::MaxPushId(id) => write!(f, "MaxPushId({id})"),
        }
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub const $name: FrameType = FrameType($val);)*
        }
    }
}

frame_types! {
    DATA = 0x0,
    HEADERS = 0x1,
    H2_PRIORITY = 0x2,
    CANCEL_PUSH = 0x3,
    SETTINGS = 0x4,
    PUSH_PROMISE = 0x5,
    H2_PING = 0x6,
    GOAWAY = 0x7,
    H2_WINDOW_UPDATE = 0x8,
    H2_CONTINUATION = 0x9,
    MAX_PUSH_ID = 0xD,
}

/// The type tag of an HTTP/3 frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FrameType(u64);

impl FrameType {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(Self(read_varint(buf)?))
    }

    pub fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        write_varint(buf, self.0);
    }

    pub fn value(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) const RESERVED: FrameType = FrameType(0x1f * 1337 + 0x21);
}

#[derive(Debug, PartialEq)]
pub enum FrameError {
    Malformed,
    /// Known frames that are never allowed in HTTP/3.
    UnsupportedFrame(u64),
    Settings(SettingsError),
    InvalidStreamId(InvalidStreamId),
}

impl FrameError {
    /// The H3 code this error closes the connection with.
    pub fn code(&self) -> Code {
        match self {
            Self::Malformed => Code::H3_FRAME_ERROR,
            Self::UnsupportedFrame(_) => Code::H3_FRAME_UNEXPECTED,
            Self::Settings(_) => Code::H3_SETTINGS_ERROR,
            Self::InvalidStreamId(_) => Code::H3_ID_ERROR,
        }
    }
}

impl std::error::Error for FrameError {}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "frame is malformed"),
            Self::UnsupportedFrame(c) => write!(f, "frame 0x{c:x} is not allowed in h3"),
            Self::Settings(x) => write!(f, "invalid settings: {x}"),
            Self::InvalidStreamId(x) => write!(f, "invalid stream id: {x}"),
        }
    }
}

impl From<SettingsError> for FrameError {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e)
    }
}

impl From<InvalidStreamId> for FrameError {
    fn from(e: InvalidStreamId) -> Self {
        Self::InvalidStreamId(e)
    }
}
