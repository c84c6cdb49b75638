//! Wire codecs for the event channel.
//!
//! Every transport reduces inbound traffic to a sequence of frames
//! (`bytes::Bytes`); an [`EventDecoder`] turns one frame into an [`Event`]
//! and an [`EventEncoder`] does the reverse. The outer length framing for
//! TCP transports lives in [`frame`]; WebSocket transports get framing from
//! the WebSocket layer itself.

mod binary;
mod frame;
mod json;
mod sbe;
mod websocket;

pub use binary::{BinaryEventDecoder, BinaryEventEncoder};
pub use frame::{FrameCodec, LOGIN_MAX_FRAME};
pub use json::{JsonEventDecoder, JsonEventEncoder};
pub use sbe::{SBE_SCHEMA_ID, SBE_SCHEMA_VERSION, SbeEventDecoder, SbeEventEncoder};
pub use websocket::{WsEventDecoder, WsEventEncoder, WsPayloadMode};

use crate::event::{Event, Payload};
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("short frame: needed {needed} bytes, got {got}")]
    ShortFrame { needed: usize, got: usize },
    #[error("frame of {0} bytes exceeds the length field")]
    FrameTooLarge(usize),
    #[error("object body of {0} bytes exceeds the 16-bit length prefix")]
    ObjectTooLarge(usize),
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload variant not representable by this codec")]
    UnsupportedPayload,
}

/// Decodes one frame into one event.
pub trait EventDecoder: Send + Sync {
    fn decode(&self, frame: Bytes) -> Result<Event, CodecError>;
}

/// Encodes one event into one frame body (excluding any outer length field).
pub trait EventEncoder: Send + Sync {
    fn encode(&self, event: &Event) -> Result<Bytes, CodecError>;
}

/// Raw wire form of a payload for the binary-style codecs: byte payloads
/// verbatim, text as UTF-8, JSON serialized, absent payloads empty.
pub(crate) fn payload_wire_bytes(payload: &Payload) -> Result<Bytes, CodecError> {
    match payload {
        Payload::None => Ok(Bytes::new()),
        Payload::Bytes(b) => Ok(b.clone()),
        Payload::Text(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        Payload::Json(v) => Ok(Bytes::from(serde_json::to_vec(v)?)),
    }
}
