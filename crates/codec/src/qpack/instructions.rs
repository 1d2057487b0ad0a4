//! Side-channel instruction handling for a capacity-zero dynamic table.
//!
//! With no dynamic table, the only instruction a well-behaved peer can
//! legally send on its encoder stream is "set dynamic table capacity 0",
//! and the only one on its decoder stream is a stream cancellation.
//! Everything else is a connection error.

use std::fmt;

use bytes::{Buf, Bytes};

use super::prefix_int;

#[derive(Debug, PartialEq, Eq)]
pub enum InstructionError {
    /// An insertion or duplication, which requires table capacity.
    DynamicInsert,
    /// A capacity update to a non-zero value we never allowed.
    DynamicCapacity(u64),
    /// A section acknowledgment, impossible for sections with a required
    /// insert count of zero.
    SectionAck,
    /// A known-received-count increment, impossible without insertions.
    InsertCountIncrement,
    Integer,
}

impl std::error::Error for InstructionError {}

impl fmt::Display for InstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DynamicInsert => write!(f, "insertion into a dynamic table of capacity 0"),
            Self::DynamicCapacity(capacity) => {
                write!(f, "dynamic table capacity {capacity} was never allowed")
            }
            Self::SectionAck => write!(f, "acknowledgment of a section that required no inserts"),
            Self::InsertCountIncrement => write!(f, "insert count increment without insertions"),
            Self::Integer => write!(f, "invalid prefixed integer"),
        }
    }
}

/// Consume complete encoder-stream instructions from `buf`, leaving any
/// trailing partial instruction in place.
pub fn exec_encoder_instructions(buf: &mut Bytes) -> Result<(), InstructionError> {
    loop {
        if buf.is_empty() {
            return Ok(());
        }
        let first = buf.chunk()[0];
        if first & 0b1110_0000 == 0b0010_0000 {
            // Set dynamic table capacity: 001 capacity(5).
            let mut probe = buf.clone();
            match prefix_int::decode(5, &mut probe) {
                Ok((_, 0)) => *buf = probe,
                Ok((_, capacity)) => return Err(InstructionError::DynamicCapacity(capacity)),
                Err(prefix_int::Error::UnexpectedEnd) => return Ok(()),
                Err(prefix_int::Error::Overflow) => return Err(InstructionError::Integer),
            }
        } else {
            // Insert with name reference (1..), without (01..), duplicate
            // (000..): all address a table with no capacity.
            return Err(InstructionError::DynamicInsert);
        }
    }
}

/// Consume complete decoder-stream instructions from `buf`, leaving any
/// trailing partial instruction in place.
pub fn exec_decoder_instructions(buf: &mut Bytes) -> Result<(), InstructionError> {
    loop {
        if buf.is_empty() {
            return Ok(());
        }
        let first = buf.chunk()[0];
        if first & 0b1000_0000 != 0 {
            // Section acknowledgment: every section we emit has a required
            // insert count of zero, which must not be acknowledged.
            return Err(InstructionError::SectionAck);
        } else if first & 0b0100_0000 != 0 {
            // Stream cancellation: 01 stream-id(6). Nothing to evict.
            let mut probe = buf.clone();
            match prefix_int::decode(6, &mut probe) {
                Ok(_) => *buf = probe,
                Err(prefix_int::Error::UnexpectedEnd) => return Ok(()),
                Err(prefix_int::Error::Overflow) => return Err(InstructionError::Integer),
            }
        } else {
            return Err(InstructionError::InsertCountIncrement);
        }
    }
}
