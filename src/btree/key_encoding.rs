//! Order-preserving key encoding.
//!
//! Every encoded value starts with a type tag, giving the cross-type order
//! Null < Integer < Real < Text < Blob under plain byte comparison.
//!
//! INTEGER: big-endian with the sign bit flipped.
//! REAL:    IEEE-754 total-order trick (flip all bits for negatives, flip
//!          the sign bit for non-negatives).
//! TEXT/BLOB: 0x00-escaped (0x00 -> 0x00 0xFF) with a 0x00 0x00 terminator,
//!          so a composite key (value || rowid) never compares a suffix
//!          against a neighbour's content bytes.

use crate::error::{KuraError, Result};
use crate::types::Value;

pub const TAG_NULL: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_REAL: u8 = 0x03;
pub const TAG_TEXT: u8 = 0x04;
pub const TAG_BLOB: u8 = 0x05;

/// Keys must stay inline in B-tree pages.
pub const MAX_KEY_LEN: usize = 1024;

/// Encode i64 into 8 bytes that sort correctly under byte comparison.
pub fn encode_i64(val: i64) -> [u8; 8] {
    let flipped = (val as u64) ^ (1u64 << 63);
    flipped.to_be_bytes()
}

pub fn decode_i64(bytes: &[u8; 8]) -> i64 {
    let flipped = u64::from_be_bytes(*bytes);
    (flipped ^ (1u64 << 63)) as i64
}

fn encode_f64(val: f64) -> [u8; 8] {
    let bits = val.to_bits();
    let ordered = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    ordered.to_be_bytes()
}

fn push_escaped(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            buf.push(0x00);
            buf.push(0xFF);
        } else {
            buf.push(b);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}

/// Append one value's order-preserving encoding.
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Integer(v) => {
            buf.push(TAG_INTEGER);
            buf.extend_from_slice(&encode_i64(*v));
        }
        Value::Real(v) => {
            buf.push(TAG_REAL);
            buf.extend_from_slice(&encode_f64(*v));
        }
        Value::Text(v) => {
            buf.push(TAG_TEXT);
            push_escaped(buf, v.as_bytes());
        }
        Value::Blob(v) => {
            buf.push(TAG_BLOB);
            push_escaped(buf, v);
        }
    }
    if buf.len() > MAX_KEY_LEN {
        return Err(KuraError::Schema(format!(
            "key exceeds {} bytes",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Encode a composite key from values in column order.
pub fn encode_key(values: &[Value]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16);
    for value in values {
        encode_value(&mut buf, value)?;
    }
    Ok(buf)
}

/// Table-tree key for a rowid.
pub fn encode_rowid(rowid: i64) -> [u8; 8] {
    encode_i64(rowid)
}

pub fn decode_rowid(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| KuraError::Corruption("rowid key has wrong length".into()))?;
    Ok(decode_i64(&arr))
}

/// Index-tree key: indexed value followed by the rowid, so duplicate values
/// in non-unique indexes stay distinct and ordered.
pub fn encode_index_key(value: &Value, rowid: i64) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16);
    encode_value(&mut buf, value)?;
    buf.extend_from_slice(&encode_rowid(rowid));
    Ok(buf)
}

/// Prefix of all index keys for one value (for unique checks and seeks).
pub fn encode_index_prefix(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16);
    encode_value(&mut buf, value)?;
    Ok(buf)
}

pub fn compare_keys(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}
