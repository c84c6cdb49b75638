//! Outer length framing for the TCP transports: a 2-byte big-endian length
//! prefix, stripped on decode and prepended on encode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Frame cap while a connection is still in the login exchange. Raised to
/// the field maximum once the session is upgraded.
pub const LOGIN_MAX_FRAME: usize = 1024;

const LENGTH_FIELD_LEN: usize = 2;

/// `tokio_util` codec for `[len:u16 BE][body]` frames.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.min(usize::from(u16::MAX)),
        }
    }

    pub fn login() -> Self {
        Self::new(LOGIN_MAX_FRAME)
    }

    /// Lifts the login-time cap to the maximum the length field can carry.
    pub fn raise_limit(&mut self) {
        self.max_frame = usize::from(u16::MAX);
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(usize::from(u16::MAX))
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }
        let declared = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if declared > self.max_frame {
            // An oversize frame is unrecoverable on a length-prefixed stream.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {declared} bytes exceeds cap of {}", self.max_frame),
            ));
        }
        if src.len() < LENGTH_FIELD_LEN + declared {
            src.reserve(LENGTH_FIELD_LEN + declared - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_FIELD_LEN);
        Ok(Some(src.split_to(declared).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        if body.len() > usize::from(u16::MAX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame body of {} bytes exceeds the length field", body.len()),
            ));
        }
        dst.reserve(LENGTH_FIELD_LEN + body.len());
        dst.put_u16(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}
