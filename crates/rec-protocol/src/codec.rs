//! MessagePack stream codec.
//!
//! # Extension encodings (bit-exact)
//! - Timestamp → `{"__date__": <f64 seconds since the UNIX epoch, UTC>}`
//! - Uuid → `{"__uuid__": "<32 lowercase hex characters>"}`
//!
//! Any decoded map containing exactly one of these keys is rewritten to the
//! native leaf; all other maps pass through unchanged. Encoding always
//! produces the canonical forms above; decoding accepts any MessagePack
//! encoding of the map form.
//!
//! `MessageUnpacker` is a push parser: feed it arbitrary byte chunks and it
//! yields complete values in arrival order, retaining partial trailing data
//! for the next feed.

use std::collections::BTreeMap;
use std::io::Cursor;

use rmpv::Value;
use uuid::Uuid;

use crate::value::{datetime_from_epoch_secs, epoch_secs, WireValue};

const DATE_KEY: &str = "__date__";
const UUID_KEY: &str = "__uuid__";

// Retained bytes are compacted once the consumed prefix passes this size.
const COMPACT_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("msgpack write failed: {0}")]
    Write(#[from] rmpv::encode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed msgpack frame: {0}")]
    Malformed(String),
    #[error("map key is not a string")]
    NonStringKey,
    #[error("unsupported msgpack value: {0}")]
    Unsupported(String),
    #[error("invalid {UUID_KEY} payload: {0}")]
    BadUuid(String),
    #[error("invalid {DATE_KEY} payload")]
    BadDate,
}

/// Encode a value to canonical MessagePack bytes.
pub fn encode(value: &WireValue) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &to_rmpv(value))?;
    Ok(out)
}

/// Streaming unpacker over arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct MessageUnpacker {
    buf: Vec<u8>,
    pos: usize,
}

impl MessageUnpacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Yield the next complete value, or `None` if more bytes are needed.
    ///
    /// A malformed frame is an error; the unpacker must be discarded
    /// afterwards (the stream has lost framing).
    pub fn next_value(&mut self) -> Result<Option<WireValue>, DecodeError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[self.pos..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(raw) => {
                #[allow(clippy::cast_possible_truncation)]
                let consumed = cursor.position() as usize;
                self.pos += consumed;
                if self.pos >= COMPACT_THRESHOLD {
                    self.buf.drain(..self.pos);
                    self.pos = 0;
                }
                Ok(Some(from_rmpv(raw)?))
            }
            Err(err) if is_incomplete(&err) => Ok(None),
            Err(err) => Err(DecodeError::Malformed(err.to_string())),
        }
    }
}

/// True when the error means "ran out of bytes mid-value" rather than
/// "the bytes are garbage".
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io)
        | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn to_rmpv(value: &WireValue) -> Value {
    match value {
        WireValue::Nil => Value::Nil,
        WireValue::Bool(b) => Value::Boolean(*b),
        WireValue::Int(i) => Value::from(*i),
        WireValue::Float(f) => Value::F64(*f),
        WireValue::Str(s) => Value::from(s.as_str()),
        WireValue::Bin(b) => Value::Binary(b.clone()),
        WireValue::Array(items) => Value::Array(items.iter().map(to_rmpv).collect()),
        WireValue::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), to_rmpv(v)))
                .collect(),
        ),
        WireValue::Timestamp(t) => Value::Map(vec![(
            Value::from(DATE_KEY),
            Value::F64(epoch_secs(t)),
        )]),
        WireValue::Uuid(u) => Value::Map(vec![(
            Value::from(UUID_KEY),
            Value::from(format!("{:032x}", u.as_u128()).as_str()),
        )]),
    }
}

fn from_rmpv(raw: Value) -> Result<WireValue, DecodeError> {
    match raw {
        Value::Nil => Ok(WireValue::Nil),
        Value::Boolean(b) => Ok(WireValue::Bool(b)),
        Value::Integer(i) => i
            .as_i64()
            .map(WireValue::Int)
            .ok_or_else(|| DecodeError::Unsupported(format!("integer out of range: {i}"))),
        Value::F32(f) => Ok(WireValue::Float(f64::from(f))),
        Value::F64(f) => Ok(WireValue::Float(f)),
        Value::String(s) => match s.into_str() {
            Some(s) => Ok(WireValue::Str(s)),
            None => Err(DecodeError::Unsupported("non-UTF-8 string".to_owned())),
        },
        Value::Binary(b) => Ok(WireValue::Bin(b)),
        Value::Array(items) => Ok(WireValue::Array(
            items.into_iter().map(from_rmpv).collect::<Result<_, _>>()?,
        )),
        Value::Map(entries) => from_map(entries),
        other => Err(DecodeError::Unsupported(format!("{other:?}"))),
    }
}

fn from_map(entries: Vec<(Value, Value)>) -> Result<WireValue, DecodeError> {
    let mut map = BTreeMap::new();
    for (key, val) in entries {
        let key = match key {
            Value::String(s) => s.into_str().ok_or(DecodeError::NonStringKey)?,
            _ => return Err(DecodeError::NonStringKey),
        };
        map.insert(key, from_rmpv(val)?);
    }

    // Single-key extension maps become native leaves.
    if map.len() == 1 {
        if let Some(raw) = map.get(DATE_KEY) {
            let secs = match raw {
                WireValue::Float(f) => *f,
                #[allow(clippy::cast_precision_loss)]
                WireValue::Int(i) => *i as f64,
                _ => return Err(DecodeError::BadDate),
            };
            let t = datetime_from_epoch_secs(secs).ok_or(DecodeError::BadDate)?;
            return Ok(WireValue::Timestamp(t));
        }
        if let Some(raw) = map.get(UUID_KEY) {
            let hex = raw
                .as_str()
                .ok_or_else(|| DecodeError::BadUuid("not a string".to_owned()))?;
            return Ok(WireValue::Uuid(parse_uuid_hex(hex)?));
        }
    }
    Ok(WireValue::Map(map))
}

fn parse_uuid_hex(hex: &str) -> Result<Uuid, DecodeError> {
    if hex.len() != 32 {
        return Err(DecodeError::BadUuid(format!(
            "expected 32 hex characters, got {}",
            hex.len()
        )));
    }
    let bits = u128::from_str_radix(hex, 16)
        .map_err(|e| DecodeError::BadUuid(e.to_string()))?;
    Ok(Uuid::from_u128(bits))
}
