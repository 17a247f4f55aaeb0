//! Row codec: `[field_count u16][tag u8 + payload]*`.
//!
//! Integer and Real are 8-byte little-endian; Text and Blob are u32
//! length-prefixed. This is the storage format for cell payloads; key
//! encodings live in `btree::key_encoding`.

use crate::error::{KuraError, Result};
use crate::types::Value;

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

pub fn encode_row(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + values.len() * 9);
    buf.extend_from_slice(&(values.len() as u16).to_le_bytes());
    for value in values {
        match value {
            Value::Null => buf.push(TAG_NULL),
            Value::Integer(v) => {
                buf.push(TAG_INTEGER);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Real(v) => {
                buf.push(TAG_REAL);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Text(v) => {
                buf.push(TAG_TEXT);
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
            Value::Blob(v) => {
                buf.push(TAG_BLOB);
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v);
            }
        }
    }
    buf
}

pub fn decode_row(data: &[u8]) -> Result<Vec<Value>> {
    let corrupt = || KuraError::Corruption("row payload truncated".into());

    let count = u16::from_le_bytes(data.get(0..2).ok_or_else(corrupt)?.try_into().unwrap()) as usize;
    let mut values = Vec::with_capacity(count);
    let mut pos = 2;
    for _ in 0..count {
        let tag = *data.get(pos).ok_or_else(corrupt)?;
        pos += 1;
        match tag {
            TAG_NULL => values.push(Value::Null),
            TAG_INTEGER => {
                let bytes = data.get(pos..pos + 8).ok_or_else(corrupt)?;
                values.push(Value::Integer(i64::from_le_bytes(bytes.try_into().unwrap())));
                pos += 8;
            }
            TAG_REAL => {
                let bytes = data.get(pos..pos + 8).ok_or_else(corrupt)?;
                values.push(Value::Real(f64::from_bits(u64::from_le_bytes(
                    bytes.try_into().unwrap(),
                ))));
                pos += 8;
            }
            TAG_TEXT => {
                let len = u32::from_le_bytes(
                    data.get(pos..pos + 4).ok_or_else(corrupt)?.try_into().unwrap(),
                ) as usize;
                pos += 4;
                let bytes = data.get(pos..pos + len).ok_or_else(corrupt)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| KuraError::Corruption("row text is not UTF-8".into()))?;
                values.push(Value::Text(text.to_string()));
                pos += len;
            }
            TAG_BLOB => {
                let len = u32::from_le_bytes(
                    data.get(pos..pos + 4).ok_or_else(corrupt)?.try_into().unwrap(),
                ) as usize;
                pos += 4;
                values.push(Value::Blob(data.get(pos..pos + len).ok_or_else(corrupt)?.to_vec()));
                pos += len;
            }
            _ => return Err(KuraError::Corruption(format!("unknown row tag {}", tag))),
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_types() {
        let rows = vec![
            vec![
                Value::Integer(42),
                Value::Text("Alice".into()),
                Value::Null,
                Value::Real(-1.5),
                Value::Blob(vec![0, 1, 2, 255]),
            ],
            vec![],
            vec![Value::Null],
            vec![Value::Integer(i64::MIN), Value::Integer(i64::MAX)],
            vec![Value::Text("".into()), Value::Blob(vec![])],
        ];
        for row in rows {
            assert_eq!(decode_row(&encode_row(&row)).unwrap(), row);
        }
    }

    #[test]
    fn test_truncated_rejected() {
        let full = encode_row(&[Value::Integer(7), Value::Text("hello".into())]);
        for cut in 0..full.len() {
            assert!(decode_row(&full[..cut]).is_err(), "cut at {}", cut);
        }
    }
}
