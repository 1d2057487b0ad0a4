//! Stateless field-section encoding: static-table references and plain
//! literals only, so no encoder stream instructions are ever produced.

use bytes::BufMut;

use super::field::HeaderField;
use super::{prefix_int, static_};

/// Encode a field section into `block` and return its size as defined by
/// RFC 9204, section 4.1.1.3.
pub fn encode_stateless<W, I>(block: &mut W, fields: I) -> u64
where
    W: BufMut,
    I: IntoIterator<Item = HeaderField>,
{
    // Section prefix: required insert count 0, base 0.
    prefix_int::encode(8, 0, 0, block);
    prefix_int::encode(7, 0, 0, block);

    let mut mem_size = 0;
    for field in fields {
        mem_size += field.mem_size();
        if let Some(index) = static_::find(&field.name, &field.value) {
            // Indexed field line, static table.
            prefix_int::encode(6, 0b11, index, block);
        } else if let Some(index) = static_::find_name(&field.name) {
            // Literal field line with static name reference.
            prefix_int::encode(4, 0b0101, index, block);
            encode_string(&field.value, block);
        } else {
            // Literal field line with literal name.
            prefix_int::encode(3, 0b001, field.name.len() as u64, block);
            block.put_slice(&field.name);
            encode_string(&field.value, block);
        }
    }
    mem_size
}

fn encode_string<W: BufMut>(value: &[u8], block: &mut W) {
    prefix_int::encode(7, 0, value.len() as u64, block);
    block.put_slice(value);
}
