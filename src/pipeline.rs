//! Per-connection processing pipeline.
//!
//! A pipeline is an ordered list of named stages — decoders, inbound
//! handlers, encoders — with a side map for name-keyed lookup, insertion,
//! removal and replacement. It is owned by the connection's driver task and
//! mutated only there, so stages never see concurrent edits.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::codec::{EventDecoder, EventEncoder};
use crate::event::Event;
use crate::net::NetError;

pub const STAGE_EVENT_DECODER: &str = "event-decoder";
pub const STAGE_EVENT_ENCODER: &str = "event-encoder";
pub const STAGE_LOGIN_HANDLER: &str = "login-handler";
pub const STAGE_APP_HANDLER: &str = "app-handler";

/// Events a handler wants written to the peer, flushed by the driver after
/// the handler returns.
#[derive(Default)]
pub struct OutboundSink {
    queued: Vec<Event>,
}

impl OutboundSink {
    pub fn write(&mut self, event: Event) {
        self.queued.push(event);
    }

    pub(crate) fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.queued)
    }
}

/// What the driver should do after a handler has seen an event.
pub enum InboundAction {
    Continue,
    /// Login completed: flush the sink, then switch the connection to the
    /// application chain. Carried state lets the driver finalize (or roll
    /// back on a failed terminal write).
    Upgrade {
        session: std::sync::Arc<crate::session::PlayerSession>,
        game: std::sync::Arc<crate::game::Game>,
        credentials: crate::auth::Credentials,
    },
    /// Flush the sink, then close the connection.
    Close,
}

/// An application-facing stage receiving decoded events.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_inbound(
        &mut self,
        event: &Event,
        sink: &mut OutboundSink,
    ) -> Result<InboundAction, NetError>;

    fn name(&self) -> &str {
        "inbound-handler"
    }
}

pub enum Stage {
    Decoder(Box<dyn EventDecoder>),
    Handler(Box<dyn InboundHandler>),
    Encoder(Box<dyn EventEncoder>),
}

struct NamedStage {
    name: Option<String>,
    stage: Stage,
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<NamedStage>,
    by_name: HashMap<String, usize>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|s| s.name.as_deref())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Appends a stage, optionally under a name for later targeted removal
    /// or replacement.
    pub fn add_last(&mut self, name: Option<&str>, stage: Stage) {
        if let Some(name) = name {
            self.by_name.insert(name.to_owned(), self.stages.len());
        }
        self.stages.push(NamedStage {
            name: name.map(str::to_owned),
            stage,
        });
    }

    /// Removes the named stage, if present.
    pub fn remove(&mut self, name: &str) -> Option<Stage> {
        let index = self.by_name.remove(name)?;
        let removed = self.stages.remove(index);
        self.reindex();
        Some(removed.stage)
    }

    /// Replaces the named stage in place. Returns `false` when the name is
    /// unknown.
    pub fn replace(&mut self, name: &str, stage: Stage) -> bool {
        match self.by_name.get(name) {
            Some(&index) => {
                self.stages[index].stage = stage;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.stages.clear();
        self.by_name.clear();
    }

    fn reindex(&mut self) {
        self.by_name.clear();
        for (index, stage) in self.stages.iter().enumerate() {
            if let Some(name) = &stage.name {
                self.by_name.insert(name.clone(), index);
            }
        }
    }

    /// First decoder stage in pipeline order.
    pub fn decoder(&self) -> Option<&dyn EventDecoder> {
        self.stages.iter().find_map(|s| match &s.stage {
            Stage::Decoder(d) => Some(d.as_ref()),
            _ => None,
        })
    }

    /// First encoder stage in pipeline order.
    pub fn encoder(&self) -> Option<&dyn EventEncoder> {
        self.stages.iter().find_map(|s| match &s.stage {
            Stage::Encoder(e) => Some(e.as_ref()),
            _ => None,
        })
    }

    /// Runs the event through the handler stages in order. The first
    /// non-`Continue` action short-circuits the rest of the chain.
    pub async fn handle_inbound(
        &mut self,
        event: &Event,
        sink: &mut OutboundSink,
    ) -> Result<InboundAction, NetError> {
        for staged in &mut self.stages {
            if let Stage::Handler(handler) = &mut staged.stage {
                match handler.on_inbound(event, sink).await? {
                    InboundAction::Continue => {}
                    action => return Ok(action),
                }
            }
        }
        Ok(InboundAction::Continue)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<String> = self
            .stages
            .iter()
            .map(|s| {
                let kind = match s.stage {
                    Stage::Decoder(_) => "decoder",
                    Stage::Handler(_) => "handler",
                    Stage::Encoder(_) => "encoder",
                };
                match &s.name {
                    Some(name) => format!("{name}({kind})"),
                    None => format!("<anonymous>({kind})"),
                }
            })
            .collect();
        f.debug_struct("Pipeline").field("stages", &stages).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BinaryEventDecoder, BinaryEventEncoder, JsonEventDecoder};
    use bytes::Bytes;

    struct Echo;

    #[async_trait]
    impl InboundHandler for Echo {
        async fn on_inbound(
            &mut self,
            event: &Event,
            sink: &mut OutboundSink,
        ) -> Result<InboundAction, NetError> {
            sink.write(event.clone());
            Ok(InboundAction::Continue)
        }
    }

    fn sample() -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline.add_last(
            Some(STAGE_EVENT_DECODER),
            Stage::Decoder(Box::new(BinaryEventDecoder)),
        );
        pipeline.add_last(Some(STAGE_APP_HANDLER), Stage::Handler(Box::new(Echo)));
        pipeline.add_last(
            Some(STAGE_EVENT_ENCODER),
            Stage::Encoder(Box::new(BinaryEventEncoder)),
        );
        pipeline
    }

    #[tokio::test]
    async fn name_keyed_removal_and_replacement() {
        let mut pipeline = sample();
        assert!(pipeline.contains(STAGE_EVENT_DECODER));
        assert_eq!(pipeline.len(), 3);

        assert!(pipeline.replace(
            STAGE_EVENT_DECODER,
            Stage::Decoder(Box::new(JsonEventDecoder)),
        ));
        assert_eq!(pipeline.len(), 3);

        assert!(pipeline.remove(STAGE_APP_HANDLER).is_some());
        assert!(!pipeline.contains(STAGE_APP_HANDLER));
        // Named lookups survive the index shift caused by removal.
        assert!(pipeline.remove(STAGE_EVENT_ENCODER).is_some());
        assert_eq!(pipeline.stage_names(), vec![STAGE_EVENT_DECODER]);
    }

    #[tokio::test]
    async fn unknown_names_are_rejected() {
        let mut pipeline = sample();
        assert!(pipeline.remove("nope").is_none());
        assert!(!pipeline.replace("nope", Stage::Handler(Box::new(Echo))));
    }

    #[tokio::test]
    async fn handlers_run_in_order_and_sink_collects_writes() {
        let mut pipeline = sample();
        let event = pipeline
            .decoder()
            .unwrap()
            .decode(Bytes::from_static(&[0x33, 0xAA]))
            .unwrap();
        let mut sink = OutboundSink::default();
        let action = pipeline.handle_inbound(&event, &mut sink).await.unwrap();
        assert!(matches!(action, InboundAction::Continue));
        let queued = sink.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event_type(), 0x33);
    }
}
