//! JSON event codec: frame body is `[opcode:u8][utf8 JSON]`.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use super::{CodecError, EventDecoder, EventEncoder};
use crate::event::{Event, Payload};

#[derive(Debug, Default)]
pub struct JsonEventDecoder;

impl EventDecoder for JsonEventDecoder {
    fn decode(&self, frame: Bytes) -> Result<Event, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let opcode = frame[0];
        let body = &frame[1..];
        let payload = if body.is_empty() {
            Payload::None
        } else {
            Payload::Json(serde_json::from_slice::<Value>(body)?)
        };
        Ok(Event::new(opcode, payload))
    }
}

#[derive(Debug, Default)]
pub struct JsonEventEncoder;

impl EventEncoder for JsonEventEncoder {
    fn encode(&self, event: &Event) -> Result<Bytes, CodecError> {
        let body = match event.payload() {
            Payload::None => Vec::new(),
            Payload::Json(v) => serde_json::to_vec(v)?,
            Payload::Text(s) => serde_json::to_vec(&Value::from(s.as_str()))?,
            // Raw byte payloads have no canonical JSON form.
            Payload::Bytes(_) => return Err(CodecError::UnsupportedPayload),
        };
        let mut out = BytesMut::with_capacity(1 + body.len());
        out.put_u8(event.event_type());
        out.put_slice(&body);
        Ok(out.freeze())
    }
}
