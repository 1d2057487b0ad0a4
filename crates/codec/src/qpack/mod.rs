//! Stateless QPACK (RFC 9204) with a dynamic table capacity of zero.
//!
//! Sections are encoded with static-table references and plain literals,
//! so encoding never produces encoder-stream instructions and decoding
//! never blocks on them. The side channels still exist on the wire and are
//! policed by the instruction handlers below.

pub use self::decoder::{decode_stateless, Decoded, DecoderError};
pub use self::encoder::encode_stateless;
pub use self::field::HeaderField;
pub use self::instructions::{
    exec_decoder_instructions, exec_encoder_instructions, InstructionError,
};

mod decoder;
mod encoder;
mod field;
mod instructions;
mod prefix_int;
mod static_;
