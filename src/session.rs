//! Per-connection session state.
//!
//! A `Session` owns the mutable state of one client connection: status,
//! attributes, its registered event handlers and the sender used to reach
//! the client. A `PlayerSession` adds the player/game/protocol bindings used
//! after login.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use crate::auth::Credentials;
use crate::dispatcher::{EventDispatcher, EventHandler, HandlerError};
use crate::event::{Event, now_millis, opcode};
use crate::game::{GameId, Games};
use crate::id::SessionId;
use crate::protocol::Protocol;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    NotConnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl SessionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionStatus::Connecting,
            2 => SessionStatus::Connected,
            3 => SessionStatus::Closed,
            _ => SessionStatus::NotConnected,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is closed")]
    Closed(String),
}

/// Outbound path to a connected client. The concrete implementation wraps
/// the connection's outbound queue; `close` severs the underlying channel.
pub trait MessageSender: Send + Sync + std::fmt::Debug {
    fn send(&self, event: Event) -> Result<(), SendError>;
    fn is_active(&self) -> bool;
    fn close(&self);
}

pub struct Session {
    id: SessionId,
    dispatcher: Arc<EventDispatcher>,
    status: AtomicU8,
    creation_time: i64,
    last_read_write: AtomicI64,
    writable: AtomicBool,
    shutting_down: AtomicBool,
    attributes: Mutex<HashMap<String, Value>>,
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
    sender: Mutex<Option<Arc<dyn MessageSender>>>,
    close_guard: tokio::sync::Mutex<bool>,
}

impl Session {
    pub fn new(id: SessionId, dispatcher: Arc<EventDispatcher>) -> Self {
        let now = now_millis();
        Self {
            id,
            dispatcher,
            status: AtomicU8::new(SessionStatus::NotConnected as u8),
            creation_time: now,
            last_read_write: AtomicI64::new(now),
            writable: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            attributes: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
            close_guard: tokio::sync::Mutex::new(false),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn creation_time(&self) -> i64 {
        self.creation_time
    }

    pub fn last_read_write_time(&self) -> i64 {
        self.last_read_write.load(Ordering::Acquire)
    }

    /// Marks read/write activity. The timestamp never moves backwards.
    pub fn touch(&self) {
        self.last_read_write.fetch_max(now_millis(), Ordering::AcqRel);
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.lock_attributes().get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.lock_attributes().insert(key.into(), value);
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.lock_attributes().remove(key)
    }

    /// Registers a handler for this session with the dispatcher. Handlers
    /// can only be mutated while the session is not closed.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), SessionError> {
        if self.status() == SessionStatus::Closed {
            return Err(SessionError::Closed(self.id.to_string()));
        }
        self.lock_handlers().push(handler.clone());
        self.dispatcher.add_handler(handler);
        Ok(())
    }

    pub async fn remove_handler(&self, handler: &Arc<dyn EventHandler>) -> bool {
        self.lock_handlers().retain(|h| !Arc::ptr_eq(h, handler));
        self.dispatcher.remove_handler(handler).await
    }

    pub fn handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        self.lock_handlers().clone()
    }

    pub fn handlers_for(&self, event_type: u8) -> Vec<Arc<dyn EventHandler>> {
        self.lock_handlers()
            .iter()
            .filter(|h| h.event_type() == event_type || h.event_type() == opcode::ANY)
            .cloned()
            .collect()
    }

    /// Routes an event to this session's handlers via the dispatcher. All of
    /// a session's handlers live on one shard, so events published here by a
    /// single producer are handled in publish order. Closed sessions deliver
    /// nothing.
    pub fn on_event(&self, event: Event) {
        if self.status() == SessionStatus::Closed {
            debug!(session_id = %self.id, "event for closed session dropped");
            return;
        }
        self.touch();
        self.dispatcher.fire_event_for(event, &self.id);
    }

    pub fn sender(&self) -> Option<Arc<dyn MessageSender>> {
        self.lock_sender().clone()
    }

    pub fn set_sender(&self, sender: Arc<dyn MessageSender>) {
        *self.lock_sender() = Some(sender);
    }

    /// Writes an event to the connected client. Returns `false` when there
    /// is no active sender or the write was refused.
    pub fn send_to_client(&self, event: Event) -> bool {
        let Some(sender) = self.sender() else {
            debug!(session_id = %self.id, "no sender attached; outbound event dropped");
            return false;
        };
        if !sender.is_active() {
            debug!(session_id = %self.id, "sender inactive; outbound event dropped");
            return false;
        }
        match sender.send(event) {
            Ok(()) => {
                self.touch();
                self.set_writable(true);
                true
            }
            Err(SendError::Full) => {
                self.set_writable(false);
                debug!(session_id = %self.id, "outbound queue full");
                false
            }
            Err(SendError::Closed) => {
                self.set_writable(false);
                false
            }
        }
    }

    /// Idempotent shutdown: removes this session's handlers from the
    /// dispatcher, closes the sender, and marks the session closed.
    pub async fn close(&self) {
        let mut closed = self.close_guard.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        self.shutting_down.store(true, Ordering::Release);
        self.dispatcher.remove_handlers_for_session(&self.id).await;
        self.lock_handlers().clear();
        let sender = self.lock_sender().take();
        if let Some(sender) = sender {
            sender.close();
        }
        self.set_status(SessionStatus::Closed);
        debug!(session_id = %self.id, "session closed");
    }

    fn lock_attributes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn EventHandler>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_sender(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn MessageSender>>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// A session bound to a player, a game and a wire protocol. The game link
/// is a weak back-reference (`GameId` resolved through the game registry),
/// and leaving the game's session set happens exactly once, during close.
pub struct PlayerSession {
    core: Session,
    player: Arc<str>,
    game_id: GameId,
    protocol: Arc<dyn Protocol>,
    games: Weak<Games>,
    credentials: Mutex<Option<Credentials>>,
    left_game: AtomicBool,
}

impl PlayerSession {
    pub fn new(
        id: SessionId,
        dispatcher: Arc<EventDispatcher>,
        player: impl Into<Arc<str>>,
        game_id: GameId,
        protocol: Arc<dyn Protocol>,
        games: Weak<Games>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: Session::new(id, dispatcher),
            player: player.into(),
            game_id,
            protocol,
            games,
            credentials: Mutex::new(None),
            left_game: AtomicBool::new(false),
        })
    }

    pub fn player(&self) -> &str {
        &self.player
    }

    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.lock_credentials().clone()
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        *self.lock_credentials() = Some(credentials);
    }

    /// Close for player sessions: leaves the game's session set exactly
    /// once, then runs the base session shutdown.
    pub async fn close(self: &Arc<Self>) {
        if !self.left_game.swap(true, Ordering::AcqRel) {
            if let Some(games) = self.games.upgrade() {
                if let Some(game) = games.get(&self.game_id) {
                    game.disconnect_session(self);
                }
            }
        }
        self.core.close().await;
    }

    fn lock_credentials(&self) -> std::sync::MutexGuard<'_, Option<Credentials>> {
        self.credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::ops::Deref for PlayerSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.core
    }
}

impl std::fmt::Debug for PlayerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerSession")
            .field("id", self.id())
            .field("player", &self.player)
            .field("game", &self.game_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Default lifecycle handler installed on every player session's shard:
/// writes `NETWORK_MESSAGE` traffic to the client, honors client `LOG_OUT`,
/// and closes the session on `DISCONNECT`. Application traffic
/// (`SESSION_MESSAGE` and friends) is left to the handlers games register.
pub struct SessionLifecycleHandler {
    session: Weak<PlayerSession>,
    session_id: SessionId,
    registry: Weak<SessionRegistry>,
}

impl SessionLifecycleHandler {
    pub fn new(session: &Arc<PlayerSession>, registry: Weak<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::downgrade(session),
            session_id: session.id().clone(),
            registry,
        })
    }
}

impl EventHandler for SessionLifecycleHandler {
    fn event_type(&self) -> u8 {
        opcode::ANY
    }

    fn session_key(&self) -> Option<SessionId> {
        Some(self.session_id.clone())
    }

    fn name(&self) -> &str {
        "session-lifecycle"
    }

    fn on_event(&self, event: &Event) -> Result<(), HandlerError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        match event.event_type() {
            opcode::NETWORK_MESSAGE => {
                session.send_to_client(event.clone());
            }
            opcode::LOG_OUT => {
                let registry = self.registry.upgrade();
                let credentials = session.credentials();
                tokio::spawn(async move {
                    match (registry, credentials) {
                        (Some(registry), Some(credentials)) => {
                            // Explicit removal closes the session on the way
                            // out; if the entry is already gone, close here.
                            if registry.remove(&credentials).await.is_none() {
                                session.close().await;
                            }
                        }
                        _ => session.close().await,
                    }
                });
            }
            opcode::DISCONNECT => {
                tokio::spawn(async move {
                    session.close().await;
                });
            }
            opcode::EXCEPTION => {
                warn!(
                    session_id = %self.session_id,
                    payload = ?event.payload(),
                    "exception event on session"
                );
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherSettings;
    use serde_json::json;

    fn test_dispatcher() -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher::new(DispatcherSettings {
            shard_count: 1,
            ..DispatcherSettings::default()
        }))
    }

    #[tokio::test]
    async fn attributes_are_opaque_and_mutable() {
        let session = Session::new(SessionId::Seq(1), test_dispatcher());
        session.set_attribute("color", json!("red"));
        assert_eq!(session.attribute("color"), Some(json!("red")));
        assert_eq!(session.remove_attribute("color"), Some(json!("red")));
        assert_eq!(session.attribute("color"), None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_handler_mutation() {
        let session = Session::new(SessionId::Seq(2), test_dispatcher());
        session.set_status(SessionStatus::Connected);
        session.close().await;
        session.close().await;
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(session.is_shutting_down());

        struct Noop;
        impl EventHandler for Noop {
            fn event_type(&self) -> u8 {
                opcode::SESSION_MESSAGE
            }
            fn on_event(&self, _event: &Event) -> Result<(), HandlerError> {
                Ok(())
            }
        }
        assert!(session.add_handler(Arc::new(Noop)).is_err());
    }

    #[tokio::test]
    async fn touch_never_moves_backwards() {
        let session = Session::new(SessionId::Seq(3), test_dispatcher());
        let first = session.last_read_write_time();
        session.touch();
        assert!(session.last_read_write_time() >= first);
    }

    #[derive(Debug)]
    struct RecordingSender {
        sent: Mutex<Vec<u8>>,
        active: AtomicBool,
    }

    impl MessageSender for RecordingSender {
        fn send(&self, event: Event) -> Result<(), SendError> {
            self.sent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(event.event_type());
            Ok(())
        }
        fn is_active(&self) -> bool {
            self.active.load(Ordering::Acquire)
        }
        fn close(&self) {
            self.active.store(false, Ordering::Release);
        }
    }

    #[tokio::test]
    async fn send_to_client_requires_an_active_sender() {
        let session = Session::new(SessionId::Seq(4), test_dispatcher());
        assert!(!session.send_to_client(Event::stop()));

        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        });
        session.set_sender(sender.clone());
        assert!(session.send_to_client(Event::stop()));
        sender.close();
        assert!(!session.send_to_client(Event::stop()));
        let sent = sender
            .sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        assert_eq!(sent, vec![opcode::STOP]);
    }
}
