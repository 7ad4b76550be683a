//! Self-describing wire values.
//!
//! Every protocol message is a string-keyed map whose leaves are the kinds
//! below. Timestamps and instance ids are first-class leaves here; the codec
//! maps them to/from their extension encodings on the wire.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A decoded wire value.
///
/// Maps are string-keyed and ordered; the protocol never uses non-string
/// keys, and decoding a map with one is an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    /// UTC timestamp; `{"__date__": <f64 epoch seconds>}` on the wire.
    Timestamp(DateTime<Utc>),
    /// 128-bit id; `{"__uuid__": "<32 lowercase hex>"}` on the wire.
    Uuid(Uuid),
}

impl WireValue {
    pub fn as_map(&self) -> Option<&BTreeMap<String, WireValue>> {
        match self {
            WireValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            WireValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, WireValue::Nil)
    }

    /// Build a map value from key/value pairs.
    pub fn map<I>(entries: I) -> WireValue
    where
        I: IntoIterator<Item = (String, WireValue)>,
    {
        WireValue::Map(entries.into_iter().collect())
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::Str(s.to_owned())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::Str(s)
    }
}

impl From<i64> for WireValue {
    fn from(i: i64) -> Self {
        WireValue::Int(i)
    }
}

impl From<f64> for WireValue {
    fn from(f: f64) -> Self {
        WireValue::Float(f)
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        WireValue::Bool(b)
    }
}

impl From<Uuid> for WireValue {
    fn from(u: Uuid) -> Self {
        WireValue::Uuid(u)
    }
}

impl From<DateTime<Utc>> for WireValue {
    fn from(t: DateTime<Utc>) -> Self {
        WireValue::Timestamp(t)
    }
}

/// Convert fractional epoch seconds to a UTC timestamp.
///
/// Precision is microseconds; `None` for values outside the representable
/// range.
pub fn datetime_from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let micros = secs * 1_000_000.0;
    #[allow(clippy::cast_precision_loss)]
    if micros < i64::MIN as f64 || micros > i64::MAX as f64 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let micros = micros.round() as i64;
    DateTime::from_timestamp_micros(micros)
}

/// Fractional epoch seconds of a UTC timestamp, microsecond precision.
#[allow(clippy::cast_precision_loss)]
pub fn epoch_secs(t: &DateTime<Utc>) -> f64 {
    t.timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_secs_round_trips_at_micro_precision() {
        let t = datetime_from_epoch_secs(1_234.567_891).expect("in range");
        let back = datetime_from_epoch_secs(epoch_secs(&t)).expect("in range");
        assert_eq!(t, back);
    }

    #[test]
    fn epoch_secs_rejects_non_finite() {
        assert!(datetime_from_epoch_secs(f64::NAN).is_none());
        assert!(datetime_from_epoch_secs(f64::INFINITY).is_none());
    }

    #[test]
    fn negative_epoch_seconds_are_representable() {
        let t = datetime_from_epoch_secs(-1.5).expect("in range");
        assert_eq!(epoch_secs(&t), -1.5);
    }
}
