//! HTTP/3 wire codec: frame parsing, varints, stateless QPACK and the
//! typed header model.
//!
//! The codec is buffer-shaped, not stream-shaped: every entry point takes
//! the bytes a transport has delivered so far and reports either a decoded
//! value plus the remainder, or that more bytes are needed. The connection
//! core owns the re-buffering.

pub mod error;
pub mod frame;
pub mod headers;
pub mod qpack;
pub mod settings;
pub mod stream;
pub mod varint;

pub use error::{Code, ErrorLevel};
pub use frame::{parse, parse_unidi_stream_header, Frame, FrameError, Parsed, UnidiType};
pub use stream::{Fin, StreamId};
