//! Plain binary event codec: frame body is `[opcode:u8][payload bytes]`.

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, EventDecoder, EventEncoder, payload_wire_bytes};
use crate::event::{Event, Payload};

#[derive(Debug, Default)]
pub struct BinaryEventDecoder;

impl EventDecoder for BinaryEventDecoder {
    fn decode(&self, mut frame: Bytes) -> Result<Event, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let opcode = frame[0];
        let payload = frame.split_off(1);
        let payload = if payload.is_empty() {
            Payload::None
        } else {
            Payload::Bytes(payload)
        };
        Ok(Event::new(opcode, payload))
    }
}

#[derive(Debug, Default)]
pub struct BinaryEventEncoder;

impl EventEncoder for BinaryEventEncoder {
    fn encode(&self, event: &Event) -> Result<Bytes, CodecError> {
        let body = payload_wire_bytes(event.payload())?;
        let mut out = BytesMut::with_capacity(1 + body.len());
        out.put_u8(event.event_type());
        out.put_slice(&body);
        Ok(out.freeze())
    }
}
