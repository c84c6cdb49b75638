//! Protocol strategies.
//!
//! A protocol names a wire format and knows how to install its pipeline
//! stages on a connection: the event codec pair around the application
//! dispatch handler. The outer length framing belongs to the transport
//! (raised from the login cap by the driver on upgrade); WebSocket framing
//! belongs to the WebSocket layer.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{
    BinaryEventDecoder, BinaryEventEncoder, EventDecoder, EventEncoder, JsonEventDecoder,
    JsonEventEncoder, SbeEventDecoder, SbeEventEncoder, WsEventDecoder, WsEventEncoder,
    WsPayloadMode,
};
use crate::event::{Event, opcode};
use crate::net::NetError;
use crate::pipeline::{
    InboundAction, InboundHandler, OutboundSink, Pipeline, STAGE_APP_HANDLER,
    STAGE_EVENT_DECODER, STAGE_EVENT_ENCODER, Stage,
};
use crate::session::PlayerSession;

/// Named pipeline-configuration strategy for one wire format.
pub trait Protocol: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn decoder(&self) -> Box<dyn EventDecoder>;

    fn encoder(&self) -> Box<dyn EventEncoder>;

    /// Installs this protocol's application chain on the pipeline. With
    /// `clear_existing` the current chain (typically the login chain) is
    /// dropped first; without it the stages are appended.
    fn apply(&self, session: &Arc<PlayerSession>, pipeline: &mut Pipeline, clear_existing: bool) {
        if clear_existing {
            pipeline.clear();
        }
        pipeline.add_last(Some(STAGE_EVENT_DECODER), Stage::Decoder(self.decoder()));
        pipeline.add_last(
            Some(STAGE_APP_HANDLER),
            Stage::Handler(Box::new(DispatchHandler::new(session.clone()))),
        );
        pipeline.add_last(Some(STAGE_EVENT_ENCODER), Stage::Encoder(self.encoder()));
    }
}

/// Application stage: forwards decoded events onto the session's shard.
pub struct DispatchHandler {
    session: Arc<PlayerSession>,
}

impl DispatchHandler {
    pub fn new(session: Arc<PlayerSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl InboundHandler for DispatchHandler {
    async fn on_inbound(
        &mut self,
        event: &Event,
        _sink: &mut OutboundSink,
    ) -> Result<InboundAction, NetError> {
        // A crafted second LOG_IN arriving after upgrade is a no-op event.
        if event.event_type() == opcode::LOG_IN {
            debug!(session_id = %self.session.id(), "duplicate login after upgrade ignored");
            return Ok(InboundAction::Continue);
        }
        self.session.on_event(event.clone());
        Ok(InboundAction::Continue)
    }

    fn name(&self) -> &str {
        "dispatch"
    }
}

/// Length-framed `[opcode][payload bytes]` over TCP.
#[derive(Debug, Default)]
pub struct BinaryTcpProtocol;

impl Protocol for BinaryTcpProtocol {
    fn name(&self) -> &'static str {
        "binary-tcp"
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(BinaryEventDecoder)
    }

    fn encoder(&self) -> Box<dyn EventEncoder> {
        Box::new(BinaryEventEncoder)
    }
}

/// Length-framed `[opcode][utf8 JSON]` over TCP.
#[derive(Debug, Default)]
pub struct JsonTcpProtocol;

impl Protocol for JsonTcpProtocol {
    fn name(&self) -> &'static str {
        "json-tcp"
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(JsonEventDecoder)
    }

    fn encoder(&self) -> Box<dyn EventEncoder> {
        Box::new(JsonEventEncoder)
    }
}

/// Length-framed SBE-style header + block over TCP.
#[derive(Debug, Default)]
pub struct SbeProtocol;

impl Protocol for SbeProtocol {
    fn name(&self) -> &'static str {
        "sbe"
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(SbeEventDecoder)
    }

    fn encoder(&self) -> Box<dyn EventEncoder> {
        Box::new(SbeEventEncoder)
    }
}

/// Binary WebSocket messages carrying `[opcode][payload]`.
#[derive(Debug, Default)]
pub struct WebSocketProtocol {
    mode: WsPayloadMode,
}

impl WebSocketProtocol {
    pub fn new(mode: WsPayloadMode) -> Self {
        Self { mode }
    }
}

impl Protocol for WebSocketProtocol {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(WsEventDecoder::new(self.mode))
    }

    fn encoder(&self) -> Box<dyn EventEncoder> {
        Box::new(WsEventEncoder::new(self.mode))
    }
}
