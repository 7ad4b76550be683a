// rec-protocol: Wire value model, stream codec and message schema for the
// experiment recording protocol.
//
// The wire format is MessagePack with two domain extension encodings
// (timestamps and experiment instance ids); see `codec` for the exact byte
// forms and `messages` for the message-level schema.

pub mod codec;
pub mod messages;
pub mod value;

pub use codec::{encode, DecodeError, EncodeError, MessageUnpacker};
pub use messages::{InvalidMessage, Message, Sample, StatusDetail, PROTOCOL_MAJOR, PROTOCOL_MINOR};
pub use value::WireValue;
