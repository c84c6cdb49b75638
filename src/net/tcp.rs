//! Binary TCP listener: accept loop, per-connection framed codec, child
//! tracking for bounded shutdown. Also serves the JSON and SBE protocols —
//! the installed [`Protocol`] decides the codec pair.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::conn::{FrameIo, drive_connection};
use super::{NetError, ServerContext};
use crate::codec::FrameCodec;
use crate::protocol::Protocol;

const STOP_QUIET_PERIOD: Duration = Duration::from_secs(1);

pub struct TcpServer {
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    protocol: Arc<dyn Protocol>,
    shutdown: Arc<Notify>,
    children: Arc<AtomicUsize>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

impl TcpServer {
    pub fn new(ctx: Arc<ServerContext>, addr: SocketAddr, protocol: Arc<dyn Protocol>) -> Self {
        Self {
            ctx,
            addr,
            protocol,
            shutdown: Arc::new(Notify::new()),
            children: Arc::new(AtomicUsize::new(0)),
            accept_task: Mutex::new(None),
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

    /// Binds synchronously and spawns the accept loop. Starting twice is a
    /// no-op.
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
        info!(addr = %local, protocol = self.protocol.name(), "tcp listener bound");

        let ctx = self.ctx.clone();
        let protocol = self.protocol.clone();
        let shutdown = self.shutdown.clone();
        let children = self.children.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                spawn_connection(
                                    stream,
                                    peer,
                                    ctx.clone(),
                                    protocol.clone(),
                                    shutdown.clone(),
                                    children.clone(),
                                );
                            }
                            Err(error) => {
                                warn!(%error, "accept failed");
                            }
                        }
                    }
                }
            }
            debug!("tcp accept loop stopped");
        });
        *self
            .accept_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        Ok(local)
    }

    /// Closes the accept loop, then the child connections, waiting out a
    /// bounded quiet period.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + STOP_QUIET_PERIOD;
        while self.children.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            // Wake children that connected after the first notification.
            self.shutdown.notify_waiters();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let leftover = self.children.load(Ordering::Acquire);
        if leftover > 0 {
            warn!(leftover, "tcp connections still open after quiet period");
        }
        info!("tcp listener stopped");
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("addr", &self.addr)
            .field("protocol", &self.protocol.name())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    protocol: Arc<dyn Protocol>,
    shutdown: Arc<Notify>,
    children: Arc<AtomicUsize>,
) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%peer, %error, "set_nodelay failed");
    }
    children.fetch_add(1, Ordering::AcqRel);
    tokio::spawn(async move {
        let io = TcpFrameIo {
            framed: Framed::new(stream, FrameCodec::login()),
        };
        drive_connection(io, ctx, protocol, peer.to_string(), shutdown).await;
        children.fetch_sub(1, Ordering::AcqRel);
    });
}

struct TcpFrameIo {
    framed: Framed<TcpStream, FrameCodec>,
}

#[async_trait]
impl FrameIo for TcpFrameIo {
    async fn next_frame(&mut self) -> Option<Result<Bytes, NetError>> {
        match self.framed.next().await {
            None => None,
            Some(Ok(frame)) => Some(Ok(frame)),
            Some(Err(error)) => Some(Err(NetError::Io(error))),
        }
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<(), NetError> {
        self.framed.send(frame).await.map_err(NetError::Io)
    }

    fn raise_frame_limit(&mut self) {
        self.framed.codec_mut().raise_limit();
    }

    async fn shutdown(&mut self) {
        let _ = self.framed.get_mut().shutdown().await;
    }
}
