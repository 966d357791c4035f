//! Shared binary primitives for the update wire format.
//!
//! A positional `Reader`/`Writer` pair over byte buffers: variable-length
//! unsigned integers (7-bit continuation), length-prefixed strings and
//! buffers, and CBOR-encoded "any" values for loosely typed payloads.

use ciborium::value::Value as CborValue;
use serde_json::{Map, Number, Value};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("variable-length integer overflow")]
    VarIntOverflow,
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("invalid cbor payload")]
    InvalidCbor,
    #[error("unsupported any value")]
    UnsupportedAny,
    #[error("unknown content tag: {0}")]
    UnknownTag(u8),
}

#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, b: u8) {
        self.buf.push(b);
    }

    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value as u64);
    }

    pub fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let mut b = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                b |= 0x80;
            }
            self.buf.push(b);
            if value == 0 {
                return;
            }
        }
    }

    pub fn write_buf(&mut self, data: &[u8]) {
        self.write_var_u64(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_buf(s.as_bytes());
    }

    /// CBOR-encode an arbitrary JSON value, length-prefixed.
    pub fn write_any(&mut self, value: &Value) {
        let cbor = json_to_cbor(value);
        let mut out = Vec::new();
        // Serialization into a Vec cannot fail.
        let _ = ciborium::ser::into_writer(&cbor, &mut out);
        self.write_buf(&out);
    }
}

#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_eof(&self) -> bool {
        self.pos == self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_var_u32(&mut self) -> Result<u32, CodecError> {
        let v = self.read_var_u64()?;
        u32::try_from(v).map_err(|_| CodecError::VarIntOverflow)
    }

    pub fn read_var_u64(&mut self) -> Result<u64, CodecError> {
        let mut result: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let b = self.read_u8()?;
            let part = (b & 0x7f) as u64;
            result |= part
                .checked_shl(shift)
                .ok_or(CodecError::VarIntOverflow)?;
            if (b & 0x80) == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(CodecError::VarIntOverflow);
            }
        }
    }

    pub fn read_buf(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_var_u64()? as usize;
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..start + len])
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_buf()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_any(&mut self) -> Result<Value, CodecError> {
        let bytes = self.read_buf()?;
        let mut cursor = Cursor::new(bytes);
        let cbor = ciborium::de::from_reader::<CborValue, _>(&mut cursor)
            .map_err(|_| CodecError::InvalidCbor)?;
        cbor_to_json(cbor)
    }
}

fn json_to_cbor(value: &Value) -> CborValue {
    match value {
        Value::Null => CborValue::Null,
        Value::Bool(b) => CborValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CborValue::Integer(i.into())
            } else if let Some(u) = n.as_u64() {
                CborValue::Integer(u.into())
            } else {
                CborValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => CborValue::Text(s.clone()),
        Value::Array(items) => CborValue::Array(items.iter().map(json_to_cbor).collect()),
        Value::Object(map) => CborValue::Map(
            map.iter()
                .map(|(k, v)| (CborValue::Text(k.clone()), json_to_cbor(v)))
                .collect(),
        ),
    }
}

fn cbor_to_json(v: CborValue) -> Result<Value, CodecError> {
    Ok(match v {
        CborValue::Null => Value::Null,
        CborValue::Bool(b) => Value::Bool(b),
        CborValue::Integer(i) => {
            let signed: i128 = i.into();
            if signed >= 0 {
                let u = u64::try_from(signed).map_err(|_| CodecError::UnsupportedAny)?;
                Value::Number(Number::from(u))
            } else {
                let s = i64::try_from(signed).map_err(|_| CodecError::UnsupportedAny)?;
                Value::Number(Number::from(s))
            }
        }
        CborValue::Float(f) => Number::from_f64(f)
            .map(Value::Number)
            .ok_or(CodecError::UnsupportedAny)?,
        CborValue::Text(s) => Value::String(s),
        CborValue::Bytes(bytes) => Value::Array(
            bytes
                .into_iter()
                .map(|b| Value::Number(Number::from(b)))
                .collect(),
        ),
        CborValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(cbor_to_json(item)?);
            }
            Value::Array(out)
        }
        CborValue::Map(entries) => {
            let mut out = Map::new();
            for (k, v) in entries {
                let key = match k {
                    CborValue::Text(s) => s,
                    _ => return Err(CodecError::UnsupportedAny),
                };
                out.insert(key, cbor_to_json(v)?);
            }
            Value::Object(out)
        }
        _ => return Err(CodecError::UnsupportedAny),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn var_u64_roundtrip() {
        let samples = [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX];
        for v in samples {
            let mut w = Writer::new();
            w.write_var_u64(v);
            let buf = w.into_inner();
            let mut r = Reader::new(&buf);
            assert_eq!(r.read_var_u64().unwrap(), v);
            assert!(r.is_eof());
        }
    }

    #[test]
    fn string_and_any_roundtrip() {
        let mut w = Writer::new();
        w.write_string("héllo");
        w.write_any(&json!({"block_id": "b1", "client": 7, "clock": 42}));
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string().unwrap(), "héllo");
        let any = r.read_any().unwrap();
        assert_eq!(any["block_id"], json!("b1"));
        assert_eq!(any["clock"], json!(42));
    }

    #[test]
    fn truncated_input_errors() {
        let mut w = Writer::new();
        w.write_string("abcdef");
        let buf = w.into_inner();
        let mut r = Reader::new(&buf[..3]);
        assert!(matches!(r.read_string(), Err(CodecError::UnexpectedEof)));
    }
}
