//! The event model: every message moving through the runtime is a typed,
//! timestamped `Event` with an opaque payload.

use bytes::Bytes;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Single-byte event type tags carried on the wire.
///
/// `ANY` is a registration sentinel for handlers and is never sent on the
/// wire.
pub mod opcode {
    pub const ANY: u8 = 0x00;
    pub const LOG_IN: u8 = 0x01;
    pub const LOG_IN_SUCCESS: u8 = 0x02;
    pub const LOG_IN_FAILURE: u8 = 0x03;
    pub const LOG_OUT: u8 = 0x04;
    pub const SESSION_MESSAGE: u8 = 0x33;
    pub const NETWORK_MESSAGE: u8 = 0x34;
    pub const START: u8 = 0x35;
    pub const DISCONNECT: u8 = 0x36;
    pub const STOP: u8 = 0x37;
    pub const EXCEPTION: u8 = 0x38;
    pub const GAME_ENTER: u8 = 0x39;
    pub const GAME_LEAVE: u8 = 0x3A;
}

/// Event payload. Byte payloads are `bytes::Bytes`, so sharing them across
/// the decode→handler boundary is reference-counted and releasing is simply
/// dropping the last owner.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    None,
    Bytes(Bytes),
    Text(String),
    Json(Value),
}

impl Payload {
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_owned())
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A typed, timestamped message. Timestamps are set at construction and are
/// informational only; equality of decoded/encoded events is judged on type
/// and payload.
#[derive(Debug, Clone)]
pub struct Event {
    event_type: u8,
    payload: Payload,
    timestamp: i64,
}

impl Event {
    pub fn new(event_type: u8, payload: Payload) -> Self {
        Self {
            event_type,
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn event_type(&self) -> u8 {
        self.event_type
    }

    /// Retags the event. `NetworkEvent` deliberately does not expose this.
    pub fn set_type(&mut self, event_type: u8) {
        self.event_type = event_type;
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn log_in(payload: Payload) -> Self {
        Self::new(opcode::LOG_IN, payload)
    }

    pub fn log_in_success(payload: Payload) -> Self {
        Self::new(opcode::LOG_IN_SUCCESS, payload)
    }

    pub fn log_in_failure() -> Self {
        Self::new(opcode::LOG_IN_FAILURE, Payload::None)
    }

    pub fn log_out() -> Self {
        Self::new(opcode::LOG_OUT, Payload::None)
    }

    pub fn session_message(payload: Payload) -> Self {
        Self::new(opcode::SESSION_MESSAGE, payload)
    }

    pub fn disconnect() -> Self {
        Self::new(opcode::DISCONNECT, Payload::None)
    }

    pub fn start() -> Self {
        Self::new(opcode::START, Payload::None)
    }

    pub fn stop() -> Self {
        Self::new(opcode::STOP, Payload::None)
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(opcode::EXCEPTION, Payload::Text(message.into()))
    }
}

/// An event whose type is permanently `NETWORK_MESSAGE`. The invariant is
/// enforced by construction: there is no way to retag one.
#[derive(Debug, Clone)]
pub struct NetworkEvent(Event);

impl NetworkEvent {
    pub fn new(payload: Payload) -> Self {
        NetworkEvent(Event::new(opcode::NETWORK_MESSAGE, payload))
    }

    /// Wraps an existing event, retagging it to `NETWORK_MESSAGE`.
    pub fn from_event(mut event: Event) -> Self {
        event.set_type(opcode::NETWORK_MESSAGE);
        NetworkEvent(event)
    }

    pub fn event(&self) -> &Event {
        &self.0
    }

    pub fn into_event(self) -> Event {
        self.0
    }

    pub fn payload(&self) -> &Payload {
        self.0.payload()
    }
}
