//! Sharded event dispatcher.
//!
//! Events fan out across `S` single-threaded shard tasks. A session is
//! affinitized to exactly one shard by the hash of its id, which keeps all
//! of a session's handlers on a single execution context and gives FIFO
//! processing for a single producer targeting that session. There is no
//! ordering across shards.

mod shard;

use shard::{Shard, ShardControl};

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::event::{Event, opcode};
use crate::id::SessionId;

/// Error type surfaced by event handlers. Faults never propagate past the
/// shard; they are logged and the next handler runs.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A registered consumer of events.
///
/// The registration key is the handler's self-declared type; the two must
/// stay in agreement for the lifetime of the registration. A handler bound
/// to a session reports its key through [`session_key`](Self::session_key)
/// and is installed on that session's shard only.
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> u8;

    fn session_key(&self) -> Option<SessionId> {
        None
    }

    fn on_event(&self, event: &Event) -> Result<(), HandlerError>;

    fn name(&self) -> &str {
        "handler"
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Number of shards; defaults to half the logical CPUs, minimum one.
    pub shard_count: usize,
    /// Bounded per-shard event queue capacity.
    pub queue_capacity: usize,
    /// Events drained per shard wake-up before yielding.
    pub batch_size: usize,
    /// How long `close` waits for shards to quiesce before aborting them.
    pub shutdown_wait: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            queue_capacity: 32_768,
            batch_size: 256,
            shutdown_wait: Duration::from_secs(5),
        }
    }
}

pub fn default_shard_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 2).max(1)
}

const DROP_WARN_THROTTLE: Duration = Duration::from_secs(2);

struct ShardHandle {
    events: mpsc::Sender<Event>,
    control: mpsc::UnboundedSender<ShardControl>,
    task: Mutex<Option<JoinHandle<()>>>,
    last_drop_warn: Mutex<Instant>,
}

pub struct EventDispatcher {
    shards: Vec<ShardHandle>,
    closed: AtomicBool,
    dropped_events: AtomicU64,
    settings: DispatcherSettings,
}

impl EventDispatcher {
    pub fn new(settings: DispatcherSettings) -> Self {
        let shard_count = settings.shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let (events_tx, events_rx) = mpsc::channel(settings.queue_capacity.max(1));
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(Shard::new(index).run(
                events_rx,
                control_rx,
                settings.batch_size.max(1),
            ));
            shards.push(ShardHandle {
                events: events_tx,
                control: control_tx,
                task: Mutex::new(Some(task)),
                last_drop_warn: Mutex::new(Instant::now() - DROP_WARN_THROTTLE),
            });
        }
        Self {
            shards,
            closed: AtomicBool::new(false),
            dropped_events: AtomicU64::new(0),
            settings,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Events dropped so far because a shard queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Shard index a session id is affinitized to.
    pub fn shard_index(&self, session: &SessionId) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        session.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Publishes an event with no session context: fan-out to every shard so
    /// handlers registered anywhere see it.
    pub fn fire_event(&self, event: Event) {
        if self.is_closed() {
            debug!(event_type = event.event_type(), "dispatcher closed; event ignored");
            return;
        }
        for shard_index in 0..self.shards.len() {
            self.enqueue(shard_index, event.clone());
        }
    }

    /// Publishes an event routed by session key: only the session's shard
    /// receives it, in FIFO order relative to this producer.
    pub fn fire_event_for(&self, event: Event, session: &SessionId) {
        if self.is_closed() {
            debug!(event_type = event.event_type(), "dispatcher closed; event ignored");
            return;
        }
        let shard_index = self.shard_index(session);
        self.enqueue(shard_index, event);
    }

    fn enqueue(&self, shard_index: usize, event: Event) {
        let shard = &self.shards[shard_index];
        match shard.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                let mut last = shard
                    .last_drop_warn
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if last.elapsed() >= DROP_WARN_THROTTLE {
                    *last = Instant::now();
                    warn!(
                        shard = shard_index,
                        event_type = event.event_type(),
                        dropped = self.dropped_events(),
                        "shard queue full; dropping event"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(shard = shard_index, "shard queue closed; event ignored");
            }
        }
    }

    /// Installs a handler. `ANY`-typed handlers go to every shard's any-list;
    /// session handlers go to their session's shard only; everything else is
    /// installed on every shard under its type.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        if self.is_closed() {
            debug!(handler = handler.name(), "dispatcher closed; handler not added");
            return;
        }
        if handler.event_type() == opcode::ANY {
            if let Some(session) = handler.session_key() {
                let shard = &self.shards[self.shard_index(&session)];
                let _ = shard.control.send(ShardControl::AddAny(handler));
            } else {
                for shard in &self.shards {
                    let _ = shard.control.send(ShardControl::AddAny(handler.clone()));
                }
            }
        } else if let Some(session) = handler.session_key() {
            let shard = &self.shards[self.shard_index(&session)];
            let _ = shard.control.send(ShardControl::Add(handler));
        } else {
            for shard in &self.shards {
                let _ = shard.control.send(ShardControl::Add(handler.clone()));
            }
        }
    }

    /// Removes one handler from every shard it is installed on. Returns
    /// whether any registration matched.
    pub async fn remove_handler(&self, handler: &Arc<dyn EventHandler>) -> bool {
        let mut receivers = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (done, rx) = oneshot::channel();
            if shard
                .control
                .send(ShardControl::Remove {
                    handler: handler.clone(),
                    done,
                })
                .is_ok()
            {
                receivers.push(rx);
            }
        }
        let mut removed = false;
        for rx in receivers {
            removed |= rx.await.unwrap_or(false);
        }
        removed
    }

    /// Removes every handler registered for an exact event type. Returns the
    /// number of registrations removed.
    pub async fn remove_handlers_for_event(&self, event_type: u8) -> usize {
        let mut receivers = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (done, rx) = oneshot::channel();
            if shard
                .control
                .send(ShardControl::RemoveForEvent { event_type, done })
                .is_ok()
            {
                receivers.push(rx);
            }
        }
        let mut removed = 0;
        for rx in receivers {
            removed += rx.await.unwrap_or(0);
        }
        removed
    }

    /// Removes every handler keyed to a session. Returns `true` iff at least
    /// one registration matched.
    pub async fn remove_handlers_for_session(&self, session: &SessionId) -> bool {
        let mut receivers = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (done, rx) = oneshot::channel();
            if shard
                .control
                .send(ShardControl::RemoveForSession {
                    session: session.clone(),
                    done,
                })
                .is_ok()
            {
                receivers.push(rx);
            }
        }
        let mut removed = false;
        for rx in receivers {
            removed |= rx.await.unwrap_or(false);
        }
        removed
    }

    /// Stops all shards. Idempotent; publishing after close is a no-op.
    /// Waits up to the configured bound for quiescence, then aborts.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for shard in &self.shards {
            let _ = shard.control.send(ShardControl::Stop);
        }
        for (index, shard) in self.shards.iter().enumerate() {
            let task = shard
                .task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            let Some(task) = task else { continue };
            let abort = task.abort_handle();
            match timeout(self.settings.shutdown_wait, task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(shard = index, "shard did not quiesce in time; aborting");
                    abort.abort();
                }
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("shards", &self.shards.len())
            .field("closed", &self.is_closed())
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}
