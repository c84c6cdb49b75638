//! Runtime assembly: wires the dispatcher, session registry, games and
//! listeners together behind idempotent `start`/`stop`.
//!
//! The process bootstrap shell (CLI, banner, signal handling) lives outside
//! this crate; it constructs a `Runtime`, calls `start`, and calls `stop` on
//! the way down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::info;

use crate::auth::{CredentialsVerifier, TokenFabric};
use crate::config::ServerConfig;
use crate::dispatcher::{DispatcherSettings, EventDispatcher};
use crate::event::Event;
use crate::game::{DefaultSessionFactory, Game, GameId, Games};
use crate::id::IdGenerator;
use crate::net::{NetError, ServerContext, ServerManager};
use crate::registry::{RegistrySettings, SessionRegistry};

/// Name of the game every runtime registers up front; logins attach here
/// unless their credentials select another game.
pub const DEFAULT_GAME: &str = "default";

pub struct Runtime {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    manager: ServerManager,
    started: AtomicBool,
}

impl Runtime {
    /// Builds a runtime with default dispatcher and registry settings.
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig, verifier: Arc<dyn CredentialsVerifier>) -> Self {
        Self::with_settings(
            config,
            verifier,
            DispatcherSettings::default(),
            RegistrySettings::default(),
        )
    }

    pub fn with_settings(
        config: ServerConfig,
        verifier: Arc<dyn CredentialsVerifier>,
        dispatcher_settings: DispatcherSettings,
        registry_settings: RegistrySettings,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(dispatcher_settings));
        let registry = SessionRegistry::new(registry_settings);
        let games = Games::new();
        let default_game = GameId::new(DEFAULT_GAME);
        games.register(Game::new(
            default_game.clone(),
            Arc::new(DefaultSessionFactory),
            dispatcher.clone(),
        ));

        let ctx = Arc::new(ServerContext {
            dispatcher,
            registry,
            games,
            default_game,
            verifier,
            fabric: Arc::new(TokenFabric::generate()),
            ids: Arc::new(IdGenerator::new(&config.node_name)),
            node_name: config.node_name.clone(),
            started_at: Instant::now(),
        });
        let manager = ServerManager::new(ctx.clone(), &config);
        Self {
            config,
            ctx,
            manager,
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.ctx.dispatcher
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn games(&self) -> &Arc<Games> {
        &self.ctx.games
    }

    pub fn default_game(&self) -> Arc<Game> {
        // Registered in the constructor; only an explicit remove could take
        // it away.
        self.ctx
            .games
            .get(&self.ctx.default_game)
            .unwrap_or_else(|| {
                let game = Game::new(
                    self.ctx.default_game.clone(),
                    Arc::new(DefaultSessionFactory),
                    self.ctx.dispatcher.clone(),
                );
                self.ctx.games.register(game.clone());
                game
            })
    }

    pub fn manager(&self) -> &ServerManager {
        &self.manager
    }

    /// Starts every enabled listener. Returns once they are bound and the
    /// dispatcher is live. Idempotent; a failed start rolls back fully.
    pub async fn start(&self) -> Result<(), NetError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(error) = self.manager.start().await {
            self.started.store(false, Ordering::Release);
            return Err(error);
        }
        self.ctx.dispatcher.fire_event(Event::start());
        info!(node = %self.config.node_name, "runtime started");
        Ok(())
    }

    /// Stops listeners, drains and closes the dispatcher, and closes the
    /// session registry. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.ctx.dispatcher.fire_event(Event::stop());
        self.manager.stop().await;
        self.ctx.registry.close().await;
        self.ctx.dispatcher.close().await;
        info!(node = %self.config.node_name, "runtime stopped");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.config.node_name)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
