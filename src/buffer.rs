//! Growable byte buffer with independent read and write positions, plus the
//! primitive codecs shared by every wire format.
//!
//! Reads consume from the front and are length-checked: short reads return
//! `None` instead of panicking, leaving the caller to treat the frame as
//! malformed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::CodecError;

/// Minimum readable bytes for a string read: 4-byte length prefix plus a
/// non-empty body.
const MIN_STRING_BYTES: usize = 5;

#[derive(Debug, Default)]
pub struct ByteBuf {
    inner: BytesMut,
}

impl ByteBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    pub fn readable(&self) -> usize {
        self.inner.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Consumes the buffer, yielding its remaining readable bytes.
    pub fn freeze(self) -> Bytes {
        self.inner.freeze()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.inner.put_u8(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.inner.put_i8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.inner.put_u16(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.inner.put_i16(v);
    }

    pub fn write_u24(&mut self, v: u32) {
        self.inner.put_uint(u64::from(v & 0x00FF_FFFF), 3);
    }

    pub fn write_i24(&mut self, v: i32) {
        self.inner.put_int(i64::from(v) & 0x00FF_FFFF, 3);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.inner.put_u32(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.inner.put_i32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.inner.put_u64(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.inner.put_i64(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.inner.put_f32(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.inner.put_f64(v);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.inner.put_slice(bytes);
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.checked(1).map(|_| self.inner.get_u8())
    }

    pub fn read_i8(&mut self) -> Option<i8> {
        self.checked(1).map(|_| self.inner.get_i8())
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.checked(2).map(|_| self.inner.get_u16())
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        self.checked(2).map(|_| self.inner.get_i16())
    }

    pub fn read_u24(&mut self) -> Option<u32> {
        self.checked(3).map(|_| self.inner.get_uint(3) as u32)
    }

    pub fn read_i24(&mut self) -> Option<i32> {
        self.checked(3).map(|_| self.inner.get_int(3) as i32)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.checked(4).map(|_| self.inner.get_u32())
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.checked(4).map(|_| self.inner.get_i32())
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.checked(8).map(|_| self.inner.get_u64())
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.checked(8).map(|_| self.inner.get_i64())
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        self.checked(4).map(|_| self.inner.get_f32())
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        self.checked(8).map(|_| self.inner.get_f64())
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<Bytes> {
        self.checked(len)?;
        Some(self.inner.split_to(len).freeze())
    }

    /// Writes a 32-bit big-endian byte length followed by the UTF-8 bytes.
    pub fn write_string(&mut self, s: &str) {
        self.inner.put_i32(s.len() as i32);
        self.inner.put_slice(s.as_bytes());
    }

    /// Counterpart of [`write_string`](Self::write_string). Requires at least
    /// five readable bytes (length prefix plus a non-empty body); anything
    /// shorter, a bad declared length, or invalid UTF-8 reads as `None`
    /// without consuming input.
    pub fn read_string(&mut self) -> Option<String> {
        if self.readable() < MIN_STRING_BYTES {
            return None;
        }
        let declared = {
            let prefix = &self.inner[..4];
            i32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]])
        };
        if declared < 0 {
            return None;
        }
        let len = declared as usize;
        if self.readable() < 4 + len {
            return None;
        }
        let text = match std::str::from_utf8(&self.inner[4..4 + len]) {
            Ok(text) => text.to_owned(),
            Err(_) => return None,
        };
        self.inner.advance(4 + len);
        Some(text)
    }

    /// Writes a 16-bit unsigned big-endian length prefix around a JSON body.
    pub fn write_object<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let body = serde_json::to_vec(value)?;
        if body.len() > usize::from(u16::MAX) {
            return Err(CodecError::ObjectTooLarge(body.len()));
        }
        self.inner.put_u16(body.len() as u16);
        self.inner.put_slice(&body);
        Ok(())
    }

    /// Counterpart of [`write_object`](Self::write_object).
    pub fn read_object<T: DeserializeOwned>(&mut self) -> Option<T> {
        if self.readable() < 2 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.inner[0], self.inner[1]]));
        if self.readable() < 2 + len {
            return None;
        }
        let value = serde_json::from_slice(&self.inner[2..2 + len]).ok()?;
        self.inner.advance(2 + len);
        Some(value)
    }

    fn checked(&self, needed: usize) -> Option<()> {
        (self.readable() >= needed).then_some(())
    }
}

impl From<Bytes> for ByteBuf {
    fn from(bytes: Bytes) -> Self {
        Self {
            inner: BytesMut::from(&bytes[..]),
        }
    }
}

impl From<&[u8]> for ByteBuf {
    fn from(bytes: &[u8]) -> Self {
        Self {
            inner: BytesMut::from(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_widths_round_trip() {
        let mut buf = ByteBuf::new();
        buf.write_u8(0xAB);
        buf.write_i16(-2);
        buf.write_u24(0x01_02_03);
        buf.write_i24(-2);
        buf.write_i32(-40_000);
        buf.write_u64(u64::MAX - 1);
        buf.write_f64(2.5);

        assert_eq!(buf.read_u8(), Some(0xAB));
        assert_eq!(buf.read_i16(), Some(-2));
        assert_eq!(buf.read_u24(), Some(0x01_02_03));
        assert_eq!(buf.read_i24(), Some(-2));
        assert_eq!(buf.read_i32(), Some(-40_000));
        assert_eq!(buf.read_u64(), Some(u64::MAX - 1));
        assert_eq!(buf.read_f64(), Some(2.5));
        assert!(buf.is_empty());
    }

    #[test]
    fn short_reads_return_none_and_consume_nothing() {
        let mut buf = ByteBuf::from(&[0x01u8][..]);
        assert_eq!(buf.read_u32(), None);
        assert_eq!(buf.readable(), 1);
        assert_eq!(buf.read_u8(), Some(0x01));
    }

    #[test]
    fn string_round_trip_including_unicode() {
        for text in ["a", "hello world", "héllo • wörld", "日本語テキスト"] {
            let mut buf = ByteBuf::new();
            buf.write_string(text);
            assert_eq!(buf.read_string().as_deref(), Some(text));
        }
    }

    #[test]
    fn string_read_requires_five_readable_bytes() {
        // A length prefix alone (an encoded empty string) is not readable.
        let mut buf = ByteBuf::new();
        buf.write_string("");
        assert_eq!(buf.readable(), 4);
        assert_eq!(buf.read_string(), None);
        assert_eq!(buf.readable(), 4);
    }

    #[test]
    fn string_read_with_truncated_body_returns_none() {
        let mut buf = ByteBuf::new();
        buf.write_i32(10);
        buf.write_bytes(b"abc");
        assert_eq!(buf.read_string(), None);
        // Nothing consumed; the caller can wait for more bytes.
        assert_eq!(buf.readable(), 7);
    }

    #[test]
    fn object_round_trip_uses_u16_prefix() {
        let mut buf = ByteBuf::new();
        buf.write_object(&json!({"k": "v", "n": 3}))
            .expect("small object encodes");
        let value: serde_json::Value = buf.read_object().expect("object decodes");
        assert_eq!(value["k"], "v");
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn oversized_object_is_rejected() {
        let big = "x".repeat(usize::from(u16::MAX) + 1);
        let mut buf = ByteBuf::new();
        assert!(matches!(
            buf.write_object(&big),
            Err(CodecError::ObjectTooLarge(_))
        ));
    }
}
