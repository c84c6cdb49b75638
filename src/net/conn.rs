//! Connection driver.
//!
//! One task per accepted connection owns the transport, the pipeline and the
//! outbound queue. Inbound frames run decoder → handlers; handler-queued and
//! session-originated events run encoder → transport. Pipeline mutation
//! (the login upgrade) happens here, on the owning task, never concurrently.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use super::{NetError, ServerContext};
use crate::event::Event;
use crate::login::login_pipeline;
use crate::pipeline::{InboundAction, OutboundSink, Pipeline};
use crate::protocol::Protocol;
use crate::session::{MessageSender, PlayerSession, SendError, SessionStatus};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Framed transport the driver runs over: length-framed TCP or binary
/// WebSocket messages.
#[async_trait]
pub(crate) trait FrameIo: Send {
    async fn next_frame(&mut self) -> Option<Result<Bytes, NetError>>;

    async fn send_frame(&mut self, frame: Bytes) -> Result<(), NetError>;

    /// Lifts any login-time frame size cap. Default: nothing to lift.
    fn raise_frame_limit(&mut self) {}

    async fn shutdown(&mut self);
}

/// Session-facing sender backed by the connection's outbound queue.
/// `close` severs the link: the driver is notified and drops the transport.
#[derive(Debug)]
pub struct ChannelSender {
    outbound: mpsc::Sender<Event>,
    active: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    peer: String,
}

impl ChannelSender {
    pub(crate) fn new(
        outbound: mpsc::Sender<Event>,
        active: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
        peer: String,
    ) -> Self {
        Self {
            outbound,
            active,
            shutdown,
            peer,
        }
    }
}

impl MessageSender for ChannelSender {
    fn send(&self, event: Event) -> Result<(), SendError> {
        if !self.is_active() {
            return Err(SendError::Closed);
        }
        match self.outbound.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.active.store(false, Ordering::Release);
                Err(SendError::Closed)
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            debug!(peer = %self.peer, "sender closed; signalling connection shutdown");
            self.shutdown.notify_one();
        }
    }
}

pub(crate) async fn drive_connection<IO: FrameIo>(
    mut io: IO,
    ctx: Arc<ServerContext>,
    protocol: Arc<dyn Protocol>,
    peer: String,
    server_shutdown: Arc<Notify>,
) {
    let mut pipeline = login_pipeline(&ctx, &protocol, &peer);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Event>(OUTBOUND_QUEUE_CAPACITY);
    let conn_shutdown = Arc::new(Notify::new());
    let active = Arc::new(AtomicBool::new(true));
    let mut attached: Option<Arc<PlayerSession>> = None;

    debug!(%peer, protocol = protocol.name(), "connection open");

    loop {
        tokio::select! {
            biased;
            event = outbound_rx.recv() => {
                let Some(event) = event else { break };
                if let Err(error) = write_event(&mut io, &pipeline, &event).await {
                    warn!(%peer, %error, "outbound write failed; closing connection");
                    break;
                }
            }
            frame = io.next_frame() => {
                match frame {
                    None => {
                        debug!(%peer, "peer closed connection");
                        break;
                    }
                    Some(Err(error)) => {
                        warn!(%peer, %error, "inbound transport failure; closing");
                        break;
                    }
                    Some(Ok(frame)) => {
                        let disconnect = process_frame(
                            &mut io,
                            &mut pipeline,
                            frame,
                            &ctx,
                            &protocol,
                            &peer,
                            &outbound_tx,
                            &conn_shutdown,
                            &active,
                            &mut attached,
                        )
                        .await;
                        if disconnect {
                            break;
                        }
                    }
                }
            }
            _ = conn_shutdown.notified() => {
                // The session side closed the sender (logout, replacement,
                // expiry). Flush what it queued, then drop the link.
                drain_outbound(&mut io, &pipeline, &mut outbound_rx, &peer).await;
                debug!(%peer, "connection closed by session");
                break;
            }
            _ = server_shutdown.notified() => {
                debug!(%peer, "connection closed by server shutdown");
                break;
            }
        }
    }

    active.store(false, Ordering::Release);
    if let Some(session) = attached {
        if session.status() != SessionStatus::Closed {
            // The link dropped without a logout: let the session's handlers
            // observe it, then close.
            session.on_event(Event::disconnect());
            session.close().await;
        }
    }
    io.shutdown().await;
    debug!(%peer, "connection closed");
}

#[allow(clippy::too_many_arguments)]
async fn process_frame<IO: FrameIo>(
    io: &mut IO,
    pipeline: &mut Pipeline,
    frame: Bytes,
    ctx: &Arc<ServerContext>,
    protocol: &Arc<dyn Protocol>,
    peer: &str,
    outbound_tx: &mpsc::Sender<Event>,
    conn_shutdown: &Arc<Notify>,
    active: &Arc<AtomicBool>,
    attached: &mut Option<Arc<PlayerSession>>,
) -> bool {
    let event = {
        let Some(decoder) = pipeline.decoder() else {
            warn!(%peer, "pipeline has no decoder; frame dropped");
            return false;
        };
        match decoder.decode(frame) {
            Ok(event) => event,
            Err(error) => {
                // Malformed frames are connection-local: drop and carry on.
                warn!(%peer, %error, "undecodable frame dropped");
                return false;
            }
        }
    };

    let mut sink = OutboundSink::default();
    let action = match pipeline.handle_inbound(&event, &mut sink).await {
        Ok(action) => action,
        Err(error) => {
            warn!(%peer, %error, "inbound handler failure; closing connection");
            return true;
        }
    };
    let flushed = flush_sink(io, pipeline, &mut sink, peer).await;

    match action {
        InboundAction::Continue => flushed.is_err(),
        InboundAction::Close => true,
        InboundAction::Upgrade {
            session,
            game,
            credentials,
        } => match flushed {
            Ok(()) => {
                let sender = Arc::new(ChannelSender::new(
                    outbound_tx.clone(),
                    active.clone(),
                    conn_shutdown.clone(),
                    peer.to_owned(),
                ));
                session.set_sender(sender);
                session.set_status(SessionStatus::Connected);
                protocol.apply(&session, pipeline, true);
                io.raise_frame_limit();
                game.connect_session(&session);
                game.on_login(&session);
                *attached = Some(session);
                false
            }
            Err(error) => {
                // The LOG_IN_SUCCESS frame never made it out; take the
                // just-created session back apart.
                warn!(%peer, %error, "login success write failed; rolling back session");
                ctx.registry.remove(&credentials).await;
                true
            }
        },
    }
}

async fn flush_sink<IO: FrameIo>(
    io: &mut IO,
    pipeline: &Pipeline,
    sink: &mut OutboundSink,
    peer: &str,
) -> Result<(), NetError> {
    for event in sink.drain() {
        write_event(io, pipeline, &event).await.map_err(|error| {
            warn!(%peer, %error, "handler write failed");
            error
        })?;
    }
    Ok(())
}

async fn write_event<IO: FrameIo>(
    io: &mut IO,
    pipeline: &Pipeline,
    event: &Event,
) -> Result<(), NetError> {
    let encoder = pipeline
        .encoder()
        .ok_or(NetError::MissingStage("encoder"))?;
    let frame = encoder.encode(event)?;
    io.send_frame(frame).await
}

async fn drain_outbound<IO: FrameIo>(
    io: &mut IO,
    pipeline: &Pipeline,
    outbound_rx: &mut mpsc::Receiver<Event>,
    peer: &str,
) {
    while let Ok(event) = outbound_rx.try_recv() {
        if let Err(error) = write_event(io, pipeline, &event).await {
            debug!(%peer, %error, "flush on close failed");
            break;
        }
    }
}
