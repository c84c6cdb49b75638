//! A dispatcher shard: one task, one bounded event queue, one handler index.
//!
//! The shard task is the only code that touches the handler index, so
//! registrations arriving from other tasks travel through the control queue
//! rather than through shared locks.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::EventHandler;
use crate::event::Event;
use crate::id::SessionId;

pub(super) enum ShardControl {
    Add(Arc<dyn EventHandler>),
    AddAny(Arc<dyn EventHandler>),
    Remove {
        handler: Arc<dyn EventHandler>,
        done: oneshot::Sender<bool>,
    },
    RemoveForEvent {
        event_type: u8,
        done: oneshot::Sender<usize>,
    },
    RemoveForSession {
        session: SessionId,
        done: oneshot::Sender<bool>,
    },
    Stop,
}

pub(super) struct Shard {
    index: usize,
    handlers: HashMap<u8, Vec<Arc<dyn EventHandler>>>,
    any_handlers: Vec<Arc<dyn EventHandler>>,
}

impl Shard {
    pub(super) fn new(index: usize) -> Self {
        Self {
            index,
            handlers: HashMap::new(),
            any_handlers: Vec::new(),
        }
    }

    /// Cooperative drain loop: control first, then batches of events with a
    /// yield between batches so one busy shard cannot starve its worker.
    pub(super) async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut control: mpsc::UnboundedReceiver<ShardControl>,
        batch_size: usize,
    ) {
        loop {
            tokio::select! {
                biased;
                ctrl = control.recv() => {
                    match ctrl {
                        None | Some(ShardControl::Stop) => break,
                        Some(ctrl) => self.apply(ctrl),
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(&event);
                    let mut drained = 1;
                    while drained < batch_size {
                        match events.try_recv() {
                            Ok(event) => {
                                self.dispatch(&event);
                                drained += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!(shard = self.index, "shard stopped");
    }

    fn apply(&mut self, ctrl: ShardControl) {
        match ctrl {
            ShardControl::Add(handler) => {
                self.handlers
                    .entry(handler.event_type())
                    .or_default()
                    .push(handler);
            }
            ShardControl::AddAny(handler) => self.any_handlers.push(handler),
            ShardControl::Remove { handler, done } => {
                let removed = self.remove_exact(&handler);
                let _ = done.send(removed);
            }
            ShardControl::RemoveForEvent { event_type, done } => {
                let removed = self.handlers.remove(&event_type).map_or(0, |v| v.len());
                let _ = done.send(removed);
            }
            ShardControl::RemoveForSession { session, done } => {
                let before = self.len();
                for list in self.handlers.values_mut() {
                    list.retain(|h| h.session_key().as_ref() != Some(&session));
                }
                self.handlers.retain(|_, list| !list.is_empty());
                self.any_handlers
                    .retain(|h| h.session_key().as_ref() != Some(&session));
                let _ = done.send(self.len() != before);
            }
            ShardControl::Stop => {}
        }
    }

    fn remove_exact(&mut self, handler: &Arc<dyn EventHandler>) -> bool {
        let mut removed = false;
        // Handlers are looked up under their self-declared type; a handler
        // registered under a different tag is unreachable here by contract.
        if let Some(list) = self.handlers.get_mut(&handler.event_type()) {
            let before = list.len();
            list.retain(|h| !Arc::ptr_eq(h, handler));
            removed |= list.len() != before;
            if list.is_empty() {
                self.handlers.remove(&handler.event_type());
            }
        }
        let before = self.any_handlers.len();
        self.any_handlers.retain(|h| !Arc::ptr_eq(h, handler));
        removed |= self.any_handlers.len() != before;
        removed
    }

    fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum::<usize>() + self.any_handlers.len()
    }

    /// Exact-type handlers in registration order, then the any-handlers.
    /// A failing handler never interrupts the ones after it.
    fn dispatch(&self, event: &Event) {
        if let Some(list) = self.handlers.get(&event.event_type()) {
            for handler in list {
                self.invoke(handler, event);
            }
        }
        for handler in &self.any_handlers {
            self.invoke(handler, event);
        }
    }

    fn invoke(&self, handler: &Arc<dyn EventHandler>, event: &Event) {
        if let Err(error) = handler.on_event(event) {
            warn!(
                shard = self.index,
                handler = handler.name(),
                event_type = event.event_type(),
                %error,
                "event handler failed; continuing with remaining handlers"
            );
        }
    }
}
