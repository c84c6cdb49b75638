//! Server listeners and the per-connection driver.

mod conn;
mod http;
mod tcp;
mod ws;

pub use conn::ChannelSender;
pub use http::HttpServer;
pub use tcp::TcpServer;
pub use ws::WsServer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::auth::{CredentialsVerifier, TokenFabric};
use crate::codec::CodecError;
use crate::config::ServerConfig;
use crate::dispatcher::EventDispatcher;
use crate::game::{GameId, Games};
use crate::id::IdGenerator;
use crate::protocol::{BinaryTcpProtocol, WebSocketProtocol};
use crate::registry::SessionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("websocket: {0}")]
    Ws(#[source] axum::Error),
    #[error("connection closed")]
    Closed,
    #[error("pipeline is missing its {0} stage")]
    MissingStage(&'static str),
    /// An application command arrived without required fields; carries the
    /// absent parameter names for the caller.
    #[error("missing required parameters: {0:?}")]
    InvalidParameter(Vec<String>),
}

/// Shared services every listener and connection needs: the dispatcher, the
/// session registry, games, login collaborators and node identity.
pub struct ServerContext {
    pub dispatcher: Arc<EventDispatcher>,
    pub registry: Arc<SessionRegistry>,
    pub games: Arc<Games>,
    pub default_game: GameId,
    pub verifier: Arc<dyn CredentialsVerifier>,
    pub fabric: Arc<TokenFabric>,
    pub ids: Arc<IdGenerator>,
    pub node_name: String,
    pub started_at: Instant,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("node_name", &self.node_name)
            .field("default_game", &self.default_game)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl ServerContext {
    pub(crate) fn for_tests(verifier: Arc<dyn CredentialsVerifier>) -> Arc<Self> {
        use crate::dispatcher::DispatcherSettings;
        use crate::game::{DefaultSessionFactory, Game};
        use crate::registry::RegistrySettings;

        let dispatcher = Arc::new(EventDispatcher::new(DispatcherSettings {
            shard_count: 2,
            ..DispatcherSettings::default()
        }));
        let games = Games::new();
        let default_game = GameId::new("default");
        games.register(Game::new(
            default_game.clone(),
            Arc::new(DefaultSessionFactory),
            dispatcher.clone(),
        ));
        Arc::new(Self {
            dispatcher,
            registry: SessionRegistry::new(RegistrySettings::default()),
            games,
            default_game,
            verifier,
            fabric: Arc::new(TokenFabric::generate()),
            ids: Arc::new(IdGenerator::new("")),
            node_name: String::new(),
            started_at: Instant::now(),
        })
    }
}

/// Orchestrates the configured listeners: binary TCP, HTTP, and WebSocket,
/// each gated by its config key. Starting twice is a no-op; a failed start
/// rolls already-bound listeners back.
pub struct ServerManager {
    tcp: Option<Arc<TcpServer>>,
    http: Option<Arc<HttpServer>>,
    ws: Option<Arc<WsServer>>,
    started: AtomicBool,
}

impl ServerManager {
    pub fn new(ctx: Arc<ServerContext>, config: &ServerConfig) -> Self {
        let tcp = config.tcp_enabled.then(|| {
            Arc::new(TcpServer::new(
                ctx.clone(),
                config.tcp_addr(),
                Arc::new(BinaryTcpProtocol),
            ))
        });
        let ws = config.ws_enabled.then(|| {
            Arc::new(WsServer::new(
                ctx.clone(),
                config.ws_addr(),
                Arc::new(WebSocketProtocol::default()),
            ))
        });
        let http = config
            .http_enabled
            .then(|| Arc::new(HttpServer::new(ctx, config.http_addr())));
        Self {
            tcp,
            http,
            ws,
            started: AtomicBool::new(false),
        }
    }

    pub async fn start(&self) -> Result<(), NetError> {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("server manager already started");
            return Ok(());
        }
        if let Some(tcp) = &self.tcp {
            if let Err(error) = tcp.start().await {
                error!(%error, "tcp listener failed to start");
                self.rollback().await;
                return Err(error);
            }
        }
        if let Some(ws) = &self.ws {
            if let Err(error) = ws.start().await {
                error!(%error, "websocket listener failed to start");
                self.rollback().await;
                return Err(error);
            }
        }
        if let Some(http) = &self.http {
            if let Err(error) = http.start().await {
                error!(%error, "http listener failed to start");
                self.rollback().await;
                return Err(error);
            }
        }
        info!(
            tcp = ?self.tcp_local_addr(),
            ws = ?self.ws_local_addr(),
            http = ?self.http_local_addr(),
            "listeners started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown_all().await;
    }

    async fn rollback(&self) {
        self.shutdown_all().await;
        self.started.store(false, Ordering::Release);
    }

    async fn shutdown_all(&self) {
        if let Some(tcp) = &self.tcp {
            tcp.stop().await;
        }
        if let Some(ws) = &self.ws {
            ws.stop().await;
        }
        if let Some(http) = &self.http {
            http.stop().await;
        }
    }

    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|s| s.local_addr())
    }

    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().and_then(|s| s.local_addr())
    }

    pub fn http_local_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|s| s.local_addr())
    }
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("tcp", &self.tcp.is_some())
            .field("http", &self.http.is_some())
            .field("ws", &self.ws.is_some())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}
