//! Message schema and strict validation.
//!
//! Every message travels as a map with exactly two keys: `type` (string) and
//! `payload` (map, or nil for `finish`). `Message::from_wire` is the single
//! validation point; `Message::to_wire` produces the canonical outbound form,
//! so constructed messages always validate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::value::WireValue;

/// Protocol major version; the server rejects any other major.
pub const PROTOCOL_MAJOR: i64 = 1;
/// Protocol minor version; informational only.
pub const PROTOCOL_MINOR: i64 = 0;

/// A scalar variable sample carried in a `record` payload.
///
/// Variable names and value kinds are discovered at runtime; a variable may
/// change kind between samples and the store accepts either.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Sample {
    fn from_wire(value: &WireValue) -> Option<Sample> {
        match value {
            WireValue::Int(i) => Some(Sample::Int(*i)),
            WireValue::Float(f) => Some(Sample::Float(*f)),
            WireValue::Bool(b) => Some(Sample::Bool(*b)),
            _ => None,
        }
    }

    fn to_wire(self) -> WireValue {
        match self {
            Sample::Int(i) => WireValue::Int(i),
            Sample::Float(f) => WireValue::Float(f),
            Sample::Bool(b) => WireValue::Bool(b),
        }
    }
}

impl fmt::Display for Sample {
    /// Storage rendering: numeric text, or `true`/`false`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sample::Int(i) => write!(f, "{i}"),
            Sample::Float(v) => write!(f, "{v}"),
            Sample::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// The optional `info`/`error` part of a `status` payload.
///
/// At most one of the two may be present in a valid message.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusDetail {
    None,
    Info(WireValue),
    Error(WireValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client handshake; must be the first message on a connection.
    Version { major: i64, minor: i64 },
    /// Server handshake reply carrying the assigned experiment instance id.
    Welcome { instance_id: Uuid },
    /// Key/value annotations; upserted per (instance, label).
    Metadata(BTreeMap<String, String>),
    /// One timestamped batch of variable samples.
    Record {
        timestamp: DateTime<Utc>,
        variables: BTreeMap<String, Sample>,
    },
    /// Server acknowledgement or error reply.
    Status { success: bool, detail: StatusDetail },
    /// Terminal client message; payload is nil.
    Finish,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid message: {reason}")]
pub struct InvalidMessage {
    pub reason: String,
}

impl InvalidMessage {
    fn new(reason: impl Into<String>) -> Self {
        InvalidMessage {
            reason: reason.into(),
        }
    }
}

impl Message {
    /// Convenience constructor: plain success acknowledgement.
    pub fn status_ok() -> Message {
        Message::Status {
            success: true,
            detail: StatusDetail::None,
        }
    }

    /// Convenience constructor: success with a `recorded` count.
    pub fn status_recorded(count: i64) -> Message {
        Message::Status {
            success: true,
            detail: StatusDetail::Info(WireValue::map([(
                "recorded".to_owned(),
                WireValue::Int(count),
            )])),
        }
    }

    /// Convenience constructor: error reply. Always `success: false`.
    pub fn status_error(text: &str) -> Message {
        Message::Status {
            success: false,
            detail: StatusDetail::Error(WireValue::from(text)),
        }
    }

    /// Short type tag, as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Version { .. } => "version",
            Message::Welcome { .. } => "welcome",
            Message::Metadata(_) => "metadata",
            Message::Record { .. } => "record",
            Message::Status { .. } => "status",
            Message::Finish => "finish",
        }
    }

    /// Validate a decoded wire value into a typed message.
    pub fn from_wire(value: &WireValue) -> Result<Message, InvalidMessage> {
        let envelope = value
            .as_map()
            .ok_or_else(|| InvalidMessage::new("message is not a map"))?;
        if envelope.len() != 2 {
            return Err(InvalidMessage::new("envelope must have exactly type and payload"));
        }
        let mtype = envelope
            .get("type")
            .and_then(WireValue::as_str)
            .ok_or_else(|| InvalidMessage::new("missing or non-string type"))?;
        let payload = envelope
            .get("payload")
            .ok_or_else(|| InvalidMessage::new("missing payload"))?;

        match mtype {
            "version" => parse_version(payload),
            "welcome" => parse_welcome(payload),
            "metadata" => parse_metadata(payload),
            "record" => parse_record(payload),
            "status" => parse_status(payload),
            "finish" => {
                if payload.is_nil() {
                    Ok(Message::Finish)
                } else {
                    Err(InvalidMessage::new("finish payload must be nil"))
                }
            }
            other => Err(InvalidMessage::new(format!("unknown message type '{other}'"))),
        }
    }

    /// Canonical outbound form. `from_wire(&m.to_wire()) == m` for every
    /// message.
    pub fn to_wire(&self) -> WireValue {
        let payload = match self {
            Message::Version { major, minor } => WireValue::map([
                ("major".to_owned(), WireValue::Int(*major)),
                ("minor".to_owned(), WireValue::Int(*minor)),
            ]),
            Message::Welcome { instance_id } => WireValue::map([(
                "instance_id".to_owned(),
                WireValue::Uuid(*instance_id),
            )]),
            Message::Metadata(pairs) => WireValue::Map(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), WireValue::from(v.clone())))
                    .collect(),
            ),
            Message::Record {
                timestamp,
                variables,
            } => WireValue::map([
                ("timestamp".to_owned(), WireValue::Timestamp(*timestamp)),
                (
                    "variables".to_owned(),
                    WireValue::Map(
                        variables
                            .iter()
                            .map(|(k, v)| (k.clone(), v.to_wire()))
                            .collect(),
                    ),
                ),
            ]),
            Message::Status { success, detail } => {
                let mut map = BTreeMap::new();
                map.insert("success".to_owned(), WireValue::Bool(*success));
                match detail {
                    StatusDetail::None => {}
                    StatusDetail::Info(v) => {
                        map.insert("info".to_owned(), v.clone());
                    }
                    StatusDetail::Error(v) => {
                        map.insert("error".to_owned(), v.clone());
                    }
                }
                WireValue::Map(map)
            }
            Message::Finish => WireValue::Nil,
        };
        WireValue::map([
            ("type".to_owned(), WireValue::from(self.type_name())),
            ("payload".to_owned(), payload),
        ])
    }
}

fn payload_map<'a>(
    payload: &'a WireValue,
    mtype: &str,
) -> Result<&'a BTreeMap<String, WireValue>, InvalidMessage> {
    payload
        .as_map()
        .ok_or_else(|| InvalidMessage::new(format!("{mtype} payload must be a map")))
}

fn parse_version(payload: &WireValue) -> Result<Message, InvalidMessage> {
    let map = payload_map(payload, "version")?;
    if map.len() != 2 {
        return Err(InvalidMessage::new("version payload must have major and minor"));
    }
    let major = map
        .get("major")
        .and_then(WireValue::as_int)
        .ok_or_else(|| InvalidMessage::new("version.major must be an integer"))?;
    let minor = map
        .get("minor")
        .and_then(WireValue::as_int)
        .ok_or_else(|| InvalidMessage::new("version.minor must be an integer"))?;
    Ok(Message::Version { major, minor })
}

fn parse_welcome(payload: &WireValue) -> Result<Message, InvalidMessage> {
    let map = payload_map(payload, "welcome")?;
    if map.len() != 1 {
        return Err(InvalidMessage::new("welcome payload must have only instance_id"));
    }
    match map.get("instance_id") {
        Some(WireValue::Uuid(id)) => Ok(Message::Welcome { instance_id: *id }),
        _ => Err(InvalidMessage::new("welcome.instance_id must be a uuid")),
    }
}

fn parse_metadata(payload: &WireValue) -> Result<Message, InvalidMessage> {
    let map = payload_map(payload, "metadata")?;
    let mut pairs = BTreeMap::new();
    for (key, val) in map {
        let val = val
            .as_str()
            .ok_or_else(|| InvalidMessage::new(format!("metadata value for '{key}' must be a string")))?;
        pairs.insert(key.clone(), val.to_owned());
    }
    Ok(Message::Metadata(pairs))
}

fn parse_record(payload: &WireValue) -> Result<Message, InvalidMessage> {
    let map = payload_map(payload, "record")?;
    if map.len() != 2 {
        return Err(InvalidMessage::new(
            "record payload must have timestamp and variables",
        ));
    }
    let timestamp = match map.get("timestamp") {
        Some(WireValue::Timestamp(t)) => *t,
        _ => return Err(InvalidMessage::new("record.timestamp must be a timestamp")),
    };
    let raw_vars = map
        .get("variables")
        .and_then(WireValue::as_map)
        .ok_or_else(|| InvalidMessage::new("record.variables must be a map"))?;
    let mut variables = BTreeMap::new();
    for (name, val) in raw_vars {
        let sample = Sample::from_wire(val).ok_or_else(|| {
            InvalidMessage::new(format!(
                "record variable '{name}' must be an integer, float or boolean"
            ))
        })?;
        variables.insert(name.clone(), sample);
    }
    Ok(Message::Record {
        timestamp,
        variables,
    })
}

fn parse_status(payload: &WireValue) -> Result<Message, InvalidMessage> {
    let map = payload_map(payload, "status")?;
    let success = map
        .get("success")
        .and_then(WireValue::as_bool)
        .ok_or_else(|| InvalidMessage::new("status.success must be a boolean"))?;
    let info = map.get("info");
    let error = map.get("error");
    if info.is_some() && error.is_some() {
        return Err(InvalidMessage::new("status may carry info or error, not both"));
    }
    let expected_len = 1 + usize::from(info.is_some() || error.is_some());
    if map.len() != expected_len {
        return Err(InvalidMessage::new("status payload has unknown keys"));
    }
    let detail = match (info, error) {
        (Some(v), None) => StatusDetail::Info(v.clone()),
        (None, Some(v)) => StatusDetail::Error(v.clone()),
        _ => StatusDetail::None,
    };
    Ok(Message::Status { success, detail })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, MessageUnpacker};
    use crate::value::datetime_from_epoch_secs;

    fn wire_roundtrip(msg: &Message) -> Message {
        // encode → split → push-parse → validate, as the server does.
        let bytes = encode(&msg.to_wire()).expect("encode");
        let mut unpacker = MessageUnpacker::new();
        for chunk in bytes.chunks(3) {
            unpacker.feed(chunk);
        }
        let value = unpacker
            .next_value()
            .expect("decode")
            .expect("complete value");
        Message::from_wire(&value).expect("valid message")
    }

    #[test]
    fn every_message_kind_survives_the_wire() {
        let t = datetime_from_epoch_secs(1.25).expect("in range");
        let messages = vec![
            Message::Version { major: 1, minor: 0 },
            Message::Welcome {
                instance_id: Uuid::from_u128(7),
            },
            Message::Metadata(BTreeMap::from([("k".to_owned(), "v".to_owned())])),
            Message::Metadata(BTreeMap::new()),
            Message::Record {
                timestamp: t,
                variables: BTreeMap::from([
                    ("a".to_owned(), Sample::Int(1)),
                    ("b".to_owned(), Sample::Float(2.5)),
                    ("c".to_owned(), Sample::Bool(false)),
                ]),
            },
            Message::Record {
                timestamp: t,
                variables: BTreeMap::new(),
            },
            Message::status_ok(),
            Message::status_recorded(3),
            Message::status_error("Invalid message."),
            Message::Finish,
        ];
        for msg in messages {
            assert_eq!(wire_roundtrip(&msg), msg);
        }
    }

    #[test]
    fn unknown_type_is_invalid() {
        let value = WireValue::map([
            ("type".to_owned(), WireValue::from("bogus")),
            ("payload".to_owned(), WireValue::Nil),
        ]);
        assert!(Message::from_wire(&value).is_err());
    }

    #[test]
    fn finish_with_payload_is_invalid() {
        let value = WireValue::map([
            ("type".to_owned(), WireValue::from("finish")),
            ("payload".to_owned(), WireValue::Map(BTreeMap::new())),
        ]);
        assert!(Message::from_wire(&value).is_err());
    }

    #[test]
    fn version_with_missing_minor_is_invalid() {
        let value = WireValue::map([
            ("type".to_owned(), WireValue::from("version")),
            (
                "payload".to_owned(),
                WireValue::map([("major".to_owned(), WireValue::Int(1))]),
            ),
        ]);
        assert!(Message::from_wire(&value).is_err());
    }

    #[test]
    fn metadata_with_non_string_value_is_invalid() {
        let value = WireValue::map([
            ("type".to_owned(), WireValue::from("metadata")),
            (
                "payload".to_owned(),
                WireValue::map([("k".to_owned(), WireValue::Int(3))]),
            ),
        ]);
        assert!(Message::from_wire(&value).is_err());
    }

    #[test]
    fn record_with_string_variable_is_invalid() {
        let t = datetime_from_epoch_secs(0.0).expect("in range");
        let value = WireValue::map([
            ("type".to_owned(), WireValue::from("record")),
            (
                "payload".to_owned(),
                WireValue::map([
                    ("timestamp".to_owned(), WireValue::Timestamp(t)),
                    (
                        "variables".to_owned(),
                        WireValue::map([("x".to_owned(), WireValue::from("nope"))]),
                    ),
                ]),
            ),
        ]);
        assert!(Message::from_wire(&value).is_err());
    }

    #[test]
    fn status_with_info_and_error_is_invalid() {
        let value = WireValue::map([
            ("type".to_owned(), WireValue::from("status")),
            (
                "payload".to_owned(),
                WireValue::map([
                    ("success".to_owned(), WireValue::Bool(false)),
                    ("info".to_owned(), WireValue::Int(1)),
                    ("error".to_owned(), WireValue::from("boom")),
                ]),
            ),
        ]);
        assert!(Message::from_wire(&value).is_err());
    }

    #[test]
    fn envelope_with_extra_keys_is_invalid() {
        let value = WireValue::map([
            ("type".to_owned(), WireValue::from("finish")),
            ("payload".to_owned(), WireValue::Nil),
            ("extra".to_owned(), WireValue::Nil),
        ]);
        assert!(Message::from_wire(&value).is_err());
    }

    #[test]
    fn sample_storage_rendering() {
        assert_eq!(Sample::Int(-3).to_string(), "-3");
        assert_eq!(Sample::Float(2.5).to_string(), "2.5");
        assert_eq!(Sample::Bool(true).to_string(), "true");
    }
}
