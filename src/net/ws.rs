//! WebSocket listener: axum upgrade at `/`, binary messages only. Each
//! upgraded socket runs the same connection driver as TCP, with the
//! WebSocket layer providing the framing.

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::conn::{FrameIo, drive_connection};
use super::{NetError, ServerContext};
use crate::protocol::Protocol;

pub struct WsServer {
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    protocol: Arc<dyn Protocol>,
    shutdown: Arc<Notify>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

#[derive(Clone)]
struct WsState {
    ctx: Arc<ServerContext>,
    protocol: Arc<dyn Protocol>,
    shutdown: Arc<Notify>,
}

impl WsServer {
    pub fn new(ctx: Arc<ServerContext>, addr: SocketAddr, protocol: Arc<dyn Protocol>) -> Self {
        Self {
            ctx,
            addr,
            protocol,
            shutdown: Arc::new(Notify::new()),
            serve_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn start(&self) -> Result<SocketAddr, NetError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(self.local_addr().unwrap_or(self.addr));
        }
        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.running.store(false, Ordering::Release);
                return Err(NetError::Bind {
                    addr: self.addr,
                    source,
                });
            }
        };
        let local = listener.local_addr()?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(local);
        info!(addr = %local, "websocket listener bound");

        let state = WsState {
            ctx: self.ctx.clone(),
            protocol: self.protocol.clone(),
            shutdown: self.shutdown.clone(),
        };
        let app = Router::new().route("/", get(ws_handler)).with_state(state);
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.notified().await });
            if let Err(error) = serve.await {
                warn!(%error, "websocket server error");
            }
            debug!("websocket serve loop stopped");
        });
        *self
            .serve_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        Ok(local)
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();
        let task = self
            .serve_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("websocket listener stopped");
    }
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("addr", &self.addr)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        drive_connection(
            WsFrameIo { socket },
            state.ctx,
            state.protocol,
            "ws-client".to_owned(),
            state.shutdown,
        )
    })
}

struct WsFrameIo {
    socket: WebSocket,
}

#[async_trait]
impl FrameIo for WsFrameIo {
    async fn next_frame(&mut self) -> Option<Result<Bytes, NetError>> {
        loop {
            match self.socket.recv().await {
                None => return None,
                Some(Err(error)) => return Some(Err(NetError::Ws(error))),
                Some(Ok(Message::Binary(frame))) => return Some(Ok(frame)),
                Some(Ok(Message::Text(_))) => {
                    // The event channel is binary; stray text frames are
                    // dropped, not fatal.
                    debug!("text frame on binary websocket dropped");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => return None,
            }
        }
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<(), NetError> {
        self.socket
            .send(Message::Binary(frame))
            .await
            .map_err(NetError::Ws)
    }

    async fn shutdown(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}
