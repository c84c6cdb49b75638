//! SBE-style framed binary codec.
//!
//! Each frame carries an 8-byte little-endian header
//! `{blockLength:u16, templateId:u16, schemaId:u16, version:u16}` followed by
//! `blockLength` payload bytes. The low byte of the template id doubles as
//! the event type tag.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use super::{CodecError, EventDecoder, EventEncoder};
use crate::event::{Event, Payload};

pub const SBE_SCHEMA_ID: u16 = 1;
pub const SBE_SCHEMA_VERSION: u16 = 1;

const HEADER_LEN: usize = 8;

#[derive(Debug, Default)]
pub struct SbeEventDecoder;

impl EventDecoder for SbeEventDecoder {
    fn decode(&self, mut frame: Bytes) -> Result<Event, CodecError> {
        if frame.len() < HEADER_LEN {
            return Err(CodecError::ShortFrame {
                needed: HEADER_LEN,
                got: frame.len(),
            });
        }
        let block_length = u16::from_le_bytes([frame[0], frame[1]]);
        let template_id = u16::from_le_bytes([frame[2], frame[3]]);
        let schema_id = u16::from_le_bytes([frame[4], frame[5]]);
        let version = u16::from_le_bytes([frame[6], frame[7]]);

        if schema_id != SBE_SCHEMA_ID || version != SBE_SCHEMA_VERSION {
            // Tolerated: the payload layout is unchanged across the versions
            // currently deployed, so decode continues.
            warn!(
                schema_id,
                version,
                expected_schema = SBE_SCHEMA_ID,
                expected_version = SBE_SCHEMA_VERSION,
                "sbe header schema mismatch"
            );
        }

        let body = frame.split_off(HEADER_LEN);
        let declared = usize::from(block_length);
        let payload = if declared > body.len() {
            warn!(
                declared,
                available = body.len(),
                template_id,
                "sbe block length exceeds frame; truncating payload"
            );
            body
        } else {
            body.slice(..declared)
        };

        let event_type = (template_id & 0x00FF) as u8;
        let payload = if payload.is_empty() {
            Payload::None
        } else {
            Payload::Bytes(payload)
        };
        Ok(Event::new(event_type, payload))
    }
}

#[derive(Debug, Default)]
pub struct SbeEventEncoder;

impl SbeEventEncoder {
    /// Payload serialization order: buffer payloads raw, text payloads as
    /// UTF-8, anything else as JSON with the `Display` form as a last
    /// resort.
    fn body_bytes(payload: &Payload) -> Bytes {
        match payload {
            Payload::None => Bytes::new(),
            Payload::Bytes(b) => b.clone(),
            Payload::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Payload::Json(v) => match serde_json::to_vec(v) {
                Ok(body) => Bytes::from(body),
                Err(error) => {
                    warn!(%error, "sbe payload json serialization failed; using string form");
                    Bytes::from(v.to_string().into_bytes())
                }
            },
        }
    }
}

impl EventEncoder for SbeEventEncoder {
    fn encode(&self, event: &Event) -> Result<Bytes, CodecError> {
        let body = Self::body_bytes(event.payload());
        if body.len() > usize::from(u16::MAX) {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u16_le(body.len() as u16);
        out.put_u16_le(u16::from(event.event_type()));
        out.put_u16_le(SBE_SCHEMA_ID);
        out.put_u16_le(SBE_SCHEMA_VERSION);
        out.put_slice(&body);
        Ok(out.freeze())
    }
}
