//! HTTP listener: liveness and a JSON status surface over the runtime's
//! registries.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{NetError, ServerContext};

pub struct HttpServer {
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

#[derive(Debug, Serialize)]
struct RegistryStatsDto {
    hits: u64,
    misses: u64,
    hit_rate: f64,
    evictions: u64,
    size: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    node: String,
    uptime_secs: u64,
    games: usize,
    dispatcher_shards: usize,
    dispatcher_dropped_events: u64,
    registry: RegistryStatsDto,
}

impl HttpServer {
    pub fn new(ctx: Arc<ServerContext>, addr: SocketAddr) -> Self {
        Self {
            ctx,
            addr,
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
        info!(addr = %local, "http listener bound");

        let app = Router::new()
            .route("/health", get(health))
            .route("/status", get(status))
            .with_state(self.ctx.clone());
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.notified().await });
            if let Err(error) = serve.await {
                warn!(%error, "http server error");
            }
            debug!("http serve loop stopped");
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
        info!("http listener stopped");
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("addr", &self.addr)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(ctx): State<Arc<ServerContext>>) -> Json<StatusResponse> {
    let stats = ctx.registry.stats();
    Json(StatusResponse {
        node: ctx.node_name.clone(),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
        games: ctx.games.len(),
        dispatcher_shards: ctx.dispatcher.shard_count(),
        dispatcher_dropped_events: ctx.dispatcher.dropped_events(),
        registry: RegistryStatsDto {
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: stats.hit_rate(),
            evictions: stats.evictions,
            size: stats.size,
        },
    })
}
