//! Game containers: the set of sessions connected to one game, broadcast,
//! and the registry resolving `GameId` back-references.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info};

use crate::dispatcher::EventDispatcher;
use crate::event::{Event, NetworkEvent, Payload};
use crate::id::{IdGenerator, SessionId};
use crate::protocol::Protocol;
use crate::registry::SessionRegistry;
use crate::session::{PlayerSession, SessionLifecycleHandler};

/// Name-based game identifier. Sessions store this instead of a strong game
/// reference; membership is resolved through [`Games`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GameId(Arc<str>);

impl GameId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        GameId(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints player sessions for a game. The default factory wires up the
/// session lifecycle handler; games with custom session state provide their
/// own.
pub trait SessionFactory: Send + Sync {
    fn create_session(
        &self,
        id: SessionId,
        player: Arc<str>,
        game_id: GameId,
        protocol: Arc<dyn Protocol>,
        dispatcher: Arc<EventDispatcher>,
        games: Weak<Games>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<PlayerSession>;
}

#[derive(Debug, Default)]
pub struct DefaultSessionFactory;

impl SessionFactory for DefaultSessionFactory {
    fn create_session(
        &self,
        id: SessionId,
        player: Arc<str>,
        game_id: GameId,
        protocol: Arc<dyn Protocol>,
        dispatcher: Arc<EventDispatcher>,
        games: Weak<Games>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<PlayerSession> {
        let session = PlayerSession::new(id, dispatcher, player, game_id, protocol, games);
        let lifecycle = SessionLifecycleHandler::new(&session, registry);
        // A freshly created session is never closed, so this cannot fail.
        let _ = session.add_handler(lifecycle);
        session
    }
}

/// Consumer hook for game-level lifecycle moments.
pub trait GameListener: Send + Sync {
    fn on_login(&self, _session: &Arc<PlayerSession>) {}

    fn on_disconnect(&self, _session: &Arc<PlayerSession>) {}
}

pub struct Game {
    id: GameId,
    factory: Arc<dyn SessionFactory>,
    dispatcher: Arc<EventDispatcher>,
    sessions: RwLock<HashMap<SessionId, Arc<PlayerSession>>>,
    listener: Mutex<Option<Arc<dyn GameListener>>>,
}

impl Game {
    pub fn new(
        id: GameId,
        factory: Arc<dyn SessionFactory>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            factory,
            dispatcher,
            sessions: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &GameId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn set_listener(&self, listener: Arc<dyn GameListener>) {
        *self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn GameListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mints a session bound to this game through the configured factory.
    pub fn create_session(
        &self,
        ids: &IdGenerator,
        player: Arc<str>,
        protocol: Arc<dyn Protocol>,
        games: &Arc<Games>,
        registry: &Arc<SessionRegistry>,
    ) -> Arc<PlayerSession> {
        self.factory.create_session(
            ids.next_id(),
            player,
            self.id.clone(),
            protocol,
            self.dispatcher.clone(),
            Arc::downgrade(games),
            Arc::downgrade(registry),
        )
    }

    /// Adds a session to the set. Idempotent; returns whether the set grew.
    pub fn connect_session(&self, session: &Arc<PlayerSession>) -> bool {
        let inserted = self
            .write_sessions()
            .insert(session.id().clone(), session.clone())
            .is_none();
        if inserted {
            debug!(game = %self.id, session_id = %session.id(), "session joined game");
            session.on_event(Event::new(crate::event::opcode::GAME_ENTER, Payload::None));
        }
        inserted
    }

    /// Removes a session from the set. Idempotent; returns whether it was a
    /// member.
    pub fn disconnect_session(&self, session: &Arc<PlayerSession>) -> bool {
        let removed = self.write_sessions().remove(session.id()).is_some();
        if removed {
            debug!(game = %self.id, session_id = %session.id(), "session left game");
            session.on_event(Event::new(crate::event::opcode::GAME_LEAVE, Payload::None));
            if let Some(listener) = self.listener() {
                listener.on_disconnect(session);
            }
        }
        removed
    }

    pub fn on_login(&self, session: &Arc<PlayerSession>) {
        info!(game = %self.id, session_id = %session.id(), player = session.player(), "player logged in");
        if let Some(listener) = self.listener() {
            listener.on_login(session);
        }
    }

    pub fn session_count(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.read_sessions().contains_key(id)
    }

    /// Routes an event into the dispatcher with no session affinity.
    pub fn send(&self, event: Event) {
        self.dispatcher.fire_event(event);
    }

    /// Fans a network event out to every member session. Iteration works on
    /// a snapshot, so concurrent joins and leaves cannot fault the loop.
    pub fn send_broadcast(&self, event: NetworkEvent) -> usize {
        let snapshot: Vec<Arc<PlayerSession>> =
            self.read_sessions().values().cloned().collect();
        let mut delivered = 0;
        for session in snapshot {
            if session.send_to_client(event.event().clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Disconnects and closes every member session.
    pub async fn close(&self) {
        let snapshot: Vec<Arc<PlayerSession>> =
            self.read_sessions().values().cloned().collect();
        for session in snapshot {
            session.close().await;
        }
        self.write_sessions().clear();
        info!(game = %self.id, "game closed");
    }

    fn read_sessions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<PlayerSession>>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<PlayerSession>>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Game")
            .field("id", &self.id)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

/// Registry of live games, keyed by id. Resolves the weak session→game
/// back-reference.
#[derive(Default)]
pub struct Games {
    games: RwLock<HashMap<GameId, Arc<Game>>>,
}

impl Games {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, game: Arc<Game>) {
        self.write_games().insert(game.id().clone(), game);
    }

    pub fn get(&self, id: &GameId) -> Option<Arc<Game>> {
        self.read_games().get(id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Game>> {
        self.get(&GameId::new(name))
    }

    pub fn remove(&self, id: &GameId) -> Option<Arc<Game>> {
        self.write_games().remove(id)
    }

    pub fn len(&self) -> usize {
        self.read_games().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_games().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Game>> {
        self.read_games().values().cloned().collect()
    }

    fn read_games(&self) -> std::sync::RwLockReadGuard<'_, HashMap<GameId, Arc<Game>>> {
        self.games
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_games(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<GameId, Arc<Game>>> {
        self.games
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Games {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Games").field("count", &self.len()).finish()
    }
}
