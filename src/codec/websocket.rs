//! WebSocket event codec: each binary WebSocket message is one frame of
//! `[opcode:u8][payload]`, with no outer length field.
//!
//! The payload is either raw bytes or a length-prefixed UTF-8 JSON string,
//! depending on the configured mode.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use super::{CodecError, EventDecoder, EventEncoder};
use crate::buffer::ByteBuf;
use crate::event::{Event, Payload, opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsPayloadMode {
    #[default]
    Binary,
    Json,
}

#[derive(Debug, Default)]
pub struct WsEventDecoder {
    mode: WsPayloadMode,
}

impl WsEventDecoder {
    pub fn new(mode: WsPayloadMode) -> Self {
        Self { mode }
    }
}

impl EventDecoder for WsEventDecoder {
    fn decode(&self, mut frame: Bytes) -> Result<Event, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let mut op = frame[0];
        // Legacy clients tag session traffic as NETWORK_MESSAGE; ingest it
        // as SESSION_MESSAGE.
        if op == opcode::NETWORK_MESSAGE {
            op = opcode::SESSION_MESSAGE;
        }
        let body = frame.split_off(1);
        let payload = match self.mode {
            WsPayloadMode::Binary => {
                if body.is_empty() {
                    Payload::None
                } else {
                    Payload::Bytes(body)
                }
            }
            WsPayloadMode::Json => {
                if body.is_empty() {
                    Payload::None
                } else {
                    let mut buf = ByteBuf::from(body);
                    let text = buf.read_string().ok_or(CodecError::ShortFrame {
                        needed: 5,
                        got: buf.readable(),
                    })?;
                    Payload::Json(serde_json::from_str::<Value>(&text)?)
                }
            }
        };
        Ok(Event::new(op, payload))
    }
}

#[derive(Debug, Default)]
pub struct WsEventEncoder {
    mode: WsPayloadMode,
}

impl WsEventEncoder {
    pub fn new(mode: WsPayloadMode) -> Self {
        Self { mode }
    }
}

impl EventEncoder for WsEventEncoder {
    fn encode(&self, event: &Event) -> Result<Bytes, CodecError> {
        let mut out = BytesMut::new();
        out.put_u8(event.event_type());
        match (self.mode, event.payload()) {
            (_, Payload::None) => {}
            (WsPayloadMode::Binary, Payload::Bytes(b)) => out.put_slice(b),
            (WsPayloadMode::Binary, Payload::Text(s)) => out.put_slice(s.as_bytes()),
            (WsPayloadMode::Binary, Payload::Json(v)) => {
                out.put_slice(&serde_json::to_vec(v)?);
            }
            (WsPayloadMode::Json, payload) => {
                let text = match payload {
                    Payload::Json(v) => serde_json::to_string(v)?,
                    Payload::Text(s) => serde_json::to_string(&Value::from(s.as_str()))?,
                    _ => return Err(CodecError::UnsupportedPayload),
                };
                let mut buf = ByteBuf::with_capacity(4 + text.len());
                buf.write_string(&text);
                out.put_slice(&buf.freeze());
            }
        }
        Ok(out.freeze())
    }
}
