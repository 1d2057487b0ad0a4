//! Stateless field-section decoding.
//!
//! This server never enables the QPACK dynamic table (it advertises a
//! capacity of zero), so every legal encoded field section has a required
//! insert count of zero and references the static table only.

use std::fmt;

use bytes::{Buf, Bytes};

use super::field::HeaderField;
use super::{prefix_int, static_};

#[derive(Debug, PartialEq, Eq)]
pub enum DecoderError {
    UnexpectedEnd,
    InvalidInteger,
    InvalidStaticIndex(u64),
    /// The section references a dynamic table this endpoint never enabled.
    DynamicReference,
    /// Huffman-coded string literals are not part of the stateless codec.
    HuffmanNotSupported,
    UnknownPrefix(u8),
    HeaderTooLong(u64),
}

impl std::error::Error for DecoderError {}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd => write!(f, "unexpected end"),
            Self::InvalidInteger => write!(f, "invalid prefixed integer"),
            Self::InvalidStaticIndex(i) => write!(f, "unknown static table index: {i}"),
            Self::DynamicReference => write!(f, "reference to a dynamic table of capacity 0"),
            Self::HuffmanNotSupported => write!(f, "huffman-coded string literal"),
            Self::UnknownPrefix(p) => write!(f, "unknown field line prefix: {p:#x}"),
            Self::HeaderTooLong(size) => write!(f, "field section of size {size} exceeds limit"),
        }
    }
}

impl From<prefix_int::Error> for DecoderError {
    fn from(e: prefix_int::Error) -> Self {
        match e {
            prefix_int::Error::UnexpectedEnd => Self::UnexpectedEnd,
            prefix_int::Error::Overflow => Self::InvalidInteger,
        }
    }
}

impl From<static_::UnknownIndex> for DecoderError {
    fn from(e: static_::UnknownIndex) -> Self {
        Self::InvalidStaticIndex(e.0)
    }
}

/// A decoded field section.
#[derive(Debug, PartialEq)]
pub struct Decoded {
    /// The fields, in wire order.
    pub fields: Vec<HeaderField>,
    /// Size as defined by RFC 9204, section 4.1.1.3.
    pub mem_size: u64,
}

/// Decode a whole encoded field section, failing once its size passes
/// `max_mem_size`.
pub fn decode_stateless(buf: &mut Bytes, max_mem_size: u64) -> Result<Decoded, DecoderError> {
    // Section prefix: required insert count, then sign + delta base. Both
    // must be zero without a dynamic table.
    let (_, required_insert_count) = prefix_int::decode(8, buf)?;
    if required_insert_count != 0 {
        return Err(DecoderError::DynamicReference);
    }
    let (sign, delta_base) = prefix_int::decode(7, buf)?;
    if sign != 0 || delta_base != 0 {
        return Err(DecoderError::DynamicReference);
    }

    let mut fields = Vec::new();
    let mut mem_size = 0u64;
    while buf.has_remaining() {
        let first = buf.chunk()[0];
        let field = if first & 0b1000_0000 != 0 {
            // Indexed field line: 1 T index(6).
            let (flags, index) = prefix_int::decode(6, buf)?;
            if flags & 0b01 == 0 {
                return Err(DecoderError::DynamicReference);
            }
            let (name, value) = static_::get(index)?;
            HeaderField {
                name: name.into(),
                value: value.into(),
            }
        } else if first & 0b0100_0000 != 0 {
            // Literal field line with name reference: 01 N T index(4).
            let (flags, index) = prefix_int::decode(4, buf)?;
            if flags & 0b0001 == 0 {
                return Err(DecoderError::DynamicReference);
            }
            let (name, _) = static_::get(index)?;
            HeaderField {
                name: name.into(),
                value: decode_string(buf)?.into(),
            }
        } else if first & 0b0010_0000 != 0 {
            // Literal field line with literal name: 001 N H len(3).
            let (flags, name_len) = prefix_int::decode(3, buf)?;
            if flags & 0b001 != 0 {
                return Err(DecoderError::HuffmanNotSupported);
            }
            let name = take(buf, name_len)?;
            HeaderField {
                name: name.into(),
                value: decode_string(buf)?.into(),
            }
        } else {
            // Post-base forms (0b0001, 0b0000) always address the dynamic
            // table.
            return Err(DecoderError::DynamicReference);
        };

        mem_size += field.mem_size();
        if mem_size > max_mem_size {
            return Err(DecoderError::HeaderTooLong(mem_size));
        }
        fields.push(field);
    }

    Ok(Decoded { fields, mem_size })
}

/// A string literal with an 8th-bit Huffman flag and 7-bit length prefix.
fn decode_string(buf: &mut Bytes) -> Result<Vec<u8>, DecoderError> {
    let (huffman, len) = prefix_int::decode(7, buf)?;
    if huffman & 0b1 != 0 {
        return Err(DecoderError::HuffmanNotSupported);
    }
    take(buf, len)
}

fn take(buf: &mut Bytes, len: u64) -> Result<Vec<u8>, DecoderError> {
    if (buf.remaining() as u64) < len {
        return Err(DecoderError::UnexpectedEnd);
    }
    Ok(buf.split_to(len as usize).to_vec())
}
