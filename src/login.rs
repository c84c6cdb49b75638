//! Login state machine.
//!
//! The first stage installed on every new connection. One framed login
//! exchange: the first event must be `LOG_IN`, its payload goes through the
//! configured credentials verifier, a fresh player session replaces any
//! sibling under the same credentials, and a minted token rides back on
//! `LOG_IN_SUCCESS`. The driver then swaps the pipeline to the protocol's
//! application chain.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::event::{Event, Payload, opcode};
use crate::net::{NetError, ServerContext};
use crate::pipeline::{
    InboundAction, InboundHandler, OutboundSink, Pipeline, STAGE_EVENT_DECODER,
    STAGE_EVENT_ENCODER, STAGE_LOGIN_HANDLER, Stage,
};
use crate::protocol::Protocol;
use crate::session::SessionStatus;

/// Credentials attribute selecting the game to attach to; the context's
/// default game is used when absent.
pub const GAME_ATTRIBUTE: &str = "game";
/// Credentials attribute carrying the player name.
pub const PLAYER_ATTRIBUTE: &str = "player";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    AwaitLogin,
    Verifying,
    Authenticated,
    Upgraded,
    Failed,
}

pub struct LoginHandler {
    ctx: Arc<ServerContext>,
    protocol: Arc<dyn Protocol>,
    peer: String,
    state: LoginState,
}

impl LoginHandler {
    pub fn new(ctx: Arc<ServerContext>, protocol: Arc<dyn Protocol>, peer: String) -> Self {
        Self {
            ctx,
            protocol,
            peer,
            state: LoginState::AwaitLogin,
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    fn fail(&mut self, sink: &mut OutboundSink) -> InboundAction {
        self.state = LoginState::Failed;
        sink.write(Event::log_in_failure());
        InboundAction::Close
    }
}

#[async_trait]
impl InboundHandler for LoginHandler {
    async fn on_inbound(
        &mut self,
        event: &Event,
        sink: &mut OutboundSink,
    ) -> Result<InboundAction, NetError> {
        match self.state {
            LoginState::AwaitLogin => {}
            // The login stage is removed from the pipeline on upgrade; a
            // repeat LOG_IN that still lands here is ignored.
            LoginState::Authenticated | LoginState::Upgraded => {
                debug!(peer = %self.peer, "event on authenticated login stage ignored");
                return Ok(InboundAction::Continue);
            }
            LoginState::Verifying => return Ok(InboundAction::Continue),
            LoginState::Failed => return Ok(InboundAction::Close),
        }

        if event.event_type() != opcode::LOG_IN {
            warn!(
                peer = %self.peer,
                event_type = event.event_type(),
                "first frame is not a login; refusing connection"
            );
            return Ok(self.fail(sink));
        }

        self.state = LoginState::Verifying;
        let credentials = match self.ctx.verifier.verify(event).await {
            Ok(credentials) => credentials,
            Err(error) => {
                warn!(peer = %self.peer, %error, "login verification failed");
                return Ok(self.fail(sink));
            }
        };

        let game = credentials
            .attribute(GAME_ATTRIBUTE)
            .and_then(|v| v.as_str())
            .and_then(|name| self.ctx.games.by_name(name))
            .or_else(|| self.ctx.games.get(&self.ctx.default_game));
        let Some(game) = game else {
            warn!(peer = %self.peer, "no game available for login");
            return Ok(self.fail(sink));
        };

        let player: Arc<str> = credentials
            .attribute(PLAYER_ATTRIBUTE)
            .and_then(|v| v.as_str())
            .unwrap_or("player")
            .into();

        let session = game.create_session(
            &self.ctx.ids,
            player,
            self.protocol.clone(),
            &self.ctx.games,
            &self.ctx.registry,
        );
        session.set_credentials(credentials.clone());
        session.set_status(SessionStatus::Connecting);

        // The atomic replacement point: a sibling session logged in under
        // the same credentials is told to log out and cleaned up before the
        // new session becomes visible.
        let replaced = self
            .ctx
            .registry
            .replace(credentials.clone(), session.clone())
            .await;
        if let Some(replaced) = replaced {
            info!(
                peer = %self.peer,
                old_session = %replaced.id(),
                new_session = %session.id(),
                "relogin kicked previous session"
            );
        }

        let token = match self.ctx.fabric.mint(credentials.random_key()) {
            Ok(token) => token,
            Err(error) => {
                warn!(peer = %self.peer, %error, "token minting failed; rolling back login");
                self.ctx.registry.remove(&credentials).await;
                return Ok(self.fail(sink));
            }
        };

        sink.write(Event::log_in_success(Payload::Text(token)));
        self.state = LoginState::Authenticated;
        Ok(InboundAction::Upgrade {
            session,
            game,
            credentials,
        })
    }

    fn name(&self) -> &str {
        "login"
    }
}

/// Pipeline every fresh connection starts with: the protocol's codec pair
/// around the login stage.
pub fn login_pipeline(
    ctx: &Arc<ServerContext>,
    protocol: &Arc<dyn Protocol>,
    peer: &str,
) -> Pipeline {
    let mut pipeline = Pipeline::new();
    pipeline.add_last(
        Some(STAGE_EVENT_DECODER),
        Stage::Decoder(protocol.decoder()),
    );
    pipeline.add_last(
        Some(STAGE_LOGIN_HANDLER),
        Stage::Handler(Box::new(LoginHandler::new(
            ctx.clone(),
            protocol.clone(),
            peer.to_owned(),
        ))),
    );
    pipeline.add_last(
        Some(STAGE_EVENT_ENCODER),
        Stage::Encoder(protocol.encoder()),
    );
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, Credentials, CredentialsVerifier};
    use crate::protocol::BinaryTcpProtocol;

    struct FixedVerifier {
        key: Option<&'static str>,
    }

    #[async_trait]
    impl CredentialsVerifier for FixedVerifier {
        async fn verify(&self, _login: &Event) -> Result<Credentials, AuthError> {
            match self.key {
                Some(key) => Credentials::new(key),
                None => Err(AuthError::Rejected),
            }
        }
    }

    fn context(verifier: FixedVerifier) -> Arc<ServerContext> {
        ServerContext::for_tests(Arc::new(verifier))
    }

    #[tokio::test]
    async fn non_login_first_frame_fails_the_connection() {
        let ctx = context(FixedVerifier {
            key: Some("abcdefgh"),
        });
        let protocol: Arc<dyn Protocol> = Arc::new(BinaryTcpProtocol);
        let mut handler = LoginHandler::new(ctx, protocol, "test".into());
        let mut sink = OutboundSink::default();
        let action = handler
            .on_inbound(&Event::session_message(Payload::None), &mut sink)
            .await
            .unwrap();
        assert!(matches!(action, InboundAction::Close));
        assert_eq!(handler.state(), LoginState::Failed);
        let queued = sink.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event_type(), opcode::LOG_IN_FAILURE);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_and_leave_registry_unchanged() {
        let ctx = context(FixedVerifier { key: None });
        let protocol: Arc<dyn Protocol> = Arc::new(BinaryTcpProtocol);
        let mut handler = LoginHandler::new(ctx.clone(), protocol, "test".into());
        let mut sink = OutboundSink::default();
        let action = handler
            .on_inbound(&Event::log_in(Payload::None), &mut sink)
            .await
            .unwrap();
        assert!(matches!(action, InboundAction::Close));
        assert_eq!(ctx.registry.len(), 0);
    }

    #[tokio::test]
    async fn successful_login_registers_session_and_mints_token() {
        let ctx = context(FixedVerifier {
            key: Some("abcdefgh"),
        });
        let protocol: Arc<dyn Protocol> = Arc::new(BinaryTcpProtocol);
        let mut handler = LoginHandler::new(ctx.clone(), protocol, "test".into());
        let mut sink = OutboundSink::default();
        let action = handler
            .on_inbound(&Event::log_in(Payload::None), &mut sink)
            .await
            .unwrap();

        let InboundAction::Upgrade { session, credentials, .. } = action else {
            panic!("expected upgrade action");
        };
        assert_eq!(handler.state(), LoginState::Authenticated);
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert!(ctx.registry.contains(&credentials));

        let queued = sink.drain();
        assert_eq!(queued[0].event_type(), opcode::LOG_IN_SUCCESS);
        let token = queued[0].payload().as_text().expect("token payload");
        assert_eq!(ctx.fabric.verify(token).unwrap(), "abcdefgh");
    }

    #[tokio::test]
    async fn relogin_returns_the_previous_session() {
        let ctx = context(FixedVerifier {
            key: Some("abcdefgh"),
        });
        let protocol: Arc<dyn Protocol> = Arc::new(BinaryTcpProtocol);

        let mut first = LoginHandler::new(ctx.clone(), protocol.clone(), "a".into());
        let mut sink = OutboundSink::default();
        let InboundAction::Upgrade { session: old, .. } =
            first.on_inbound(&Event::log_in(Payload::None), &mut sink).await.unwrap()
        else {
            panic!("expected upgrade");
        };

        let mut second = LoginHandler::new(ctx.clone(), protocol, "b".into());
        let InboundAction::Upgrade { session: new, .. } =
            second.on_inbound(&Event::log_in(Payload::None), &mut sink).await.unwrap()
        else {
            panic!("expected upgrade");
        };

        assert_eq!(ctx.registry.len(), 1);
        assert_eq!(old.status(), SessionStatus::Closed);
        assert_ne!(old.id(), new.id());
    }
}
