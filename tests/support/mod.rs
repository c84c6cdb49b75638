// Shared primitives for integration tests: a server context on ephemeral
// ports, canned verifiers, and a raw TCP frame client.

#![allow(dead_code)]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use zeal::auth::{AuthError, Credentials, CredentialsVerifier, TokenFabric};
use zeal::dispatcher::{DispatcherSettings, EventDispatcher};
use zeal::event::Event;
use zeal::game::{DefaultSessionFactory, Game, GameId, Games};
use zeal::id::IdGenerator;
use zeal::net::{ServerContext, TcpServer};
use zeal::protocol::Protocol;
use zeal::registry::{RegistrySettings, SessionRegistry};

/// Verifier that accepts every login under one fixed key, so repeated
/// logins collide in the registry.
pub struct FixedKeyVerifier {
    pub key: String,
}

#[async_trait]
impl CredentialsVerifier for FixedKeyVerifier {
    async fn verify(&self, _login: &Event) -> Result<Credentials, AuthError> {
        Credentials::new(self.key.clone())
    }
}

/// Verifier that refuses everything.
pub struct RejectVerifier;

#[async_trait]
impl CredentialsVerifier for RejectVerifier {
    async fn verify(&self, _login: &Event) -> Result<Credentials, AuthError> {
        Err(AuthError::Rejected)
    }
}

/// Builds a full server context around the provided verifier, with a
/// registered default game and a small dispatcher.
pub fn test_context(verifier: Arc<dyn CredentialsVerifier>) -> Arc<ServerContext> {
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
    Arc::new(ServerContext {
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

/// Starts a TCP listener for the given protocol on an ephemeral port.
pub async fn start_tcp(
    ctx: Arc<ServerContext>,
    protocol: Arc<dyn Protocol>,
) -> (Arc<TcpServer>, SocketAddr) {
    let server = Arc::new(TcpServer::new(
        ctx,
        "127.0.0.1:0".parse().expect("loopback addr"),
        protocol,
    ));
    let addr = server.start().await.expect("tcp listener starts");
    (server, addr)
}

/// Raw client for the length-framed TCP protocols.
pub struct FrameClient {
    stream: TcpStream,
}

impl FrameClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("client connects");
        Self { stream }
    }

    /// Writes one `[len:u16 BE][body]` frame.
    pub async fn send_frame(&mut self, body: &[u8]) {
        let len = u16::try_from(body.len()).expect("frame fits u16");
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .expect("write length");
        self.stream.write_all(body).await.expect("write body");
    }

    /// Writes raw bytes with no framing (for hand-built wire vectors).
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw");
    }

    /// Reads one frame body, or `None` on clean EOF.
    pub async fn read_frame(&mut self) -> Option<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(_) => return None,
        }
        let len = usize::from(u16::from_be_bytes(len_buf));
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.ok()?;
        Some(body)
    }

    /// True once the server has closed the connection.
    pub async fn read_eof(&mut self) -> bool {
        self.read_frame().await.is_none()
    }
}

/// Polls until the condition holds or the timeout elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
