// End-to-end login and messaging over the WebSocket listener.

mod support;

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Weak};
use support::{FixedKeyVerifier, test_context};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use zeal::dispatcher::{EventHandler, HandlerError};
use zeal::event::{Event, opcode};
use zeal::game::GameListener;
use zeal::id::SessionId;
use zeal::net::WsServer;
use zeal::protocol::WebSocketProtocol;
use zeal::session::PlayerSession;

struct EchoHandler {
    session: Weak<PlayerSession>,
    session_id: SessionId,
}

impl EventHandler for EchoHandler {
    fn event_type(&self) -> u8 {
        opcode::SESSION_MESSAGE
    }

    fn session_key(&self) -> Option<SessionId> {
        Some(self.session_id.clone())
    }

    fn on_event(&self, event: &Event) -> Result<(), HandlerError> {
        if let Some(session) = self.session.upgrade() {
            session.send_to_client(Event::new(opcode::NETWORK_MESSAGE, event.payload().clone()));
        }
        Ok(())
    }
}

struct EchoOnLogin;

impl GameListener for EchoOnLogin {
    fn on_login(&self, session: &Arc<PlayerSession>) {
        let handler = Arc::new(EchoHandler {
            session: Arc::downgrade(session),
            session_id: session.id().clone(),
        });
        session.add_handler(handler).expect("session is open");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_login_and_legacy_opcode_rewrite() {
    let ctx = test_context(Arc::new(FixedKeyVerifier {
        key: "abcdefgh".into(),
    }));
    ctx.games
        .by_name("default")
        .expect("default game")
        .set_listener(Arc::new(EchoOnLogin));

    let server = WsServer::new(
        ctx.clone(),
        "127.0.0.1:0".parse().expect("loopback addr"),
        Arc::new(WebSocketProtocol::default()),
    );
    let addr = server.start().await.expect("ws listener starts");

    let (mut socket, _) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("ws handshake");

    // One binary message is one frame: [opcode | payload].
    socket
        .send(Message::Binary(vec![opcode::LOG_IN, 0x00].into()))
        .await
        .expect("send login");

    let reply = loop {
        match socket.next().await.expect("reply").expect("ws frame") {
            Message::Binary(body) => break body,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(reply[0], opcode::LOG_IN_SUCCESS);
    let token = std::str::from_utf8(&reply[1..]).expect("token utf8");
    assert_eq!(ctx.fabric.verify(token).expect("token decrypts"), "abcdefgh");
    assert_eq!(ctx.registry.len(), 1);

    // Legacy clients tag session traffic NETWORK_MESSAGE; the decoder
    // rewrites it to SESSION_MESSAGE, so the echo handler still fires.
    let mut legacy = vec![opcode::NETWORK_MESSAGE];
    legacy.extend_from_slice(b"polo");
    socket
        .send(Message::Binary(legacy.into()))
        .await
        .expect("send legacy message");

    let echoed = loop {
        match socket.next().await.expect("echo").expect("ws frame") {
            Message::Binary(body) => break body,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(echoed[0], opcode::NETWORK_MESSAGE);
    assert_eq!(&echoed[1..], b"polo");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_the_socket_tears_the_session_down() {
    let ctx = test_context(Arc::new(FixedKeyVerifier {
        key: "abcdefgh".into(),
    }));
    let server = WsServer::new(
        ctx.clone(),
        "127.0.0.1:0".parse().expect("loopback addr"),
        Arc::new(WebSocketProtocol::default()),
    );
    let addr = server.start().await.expect("ws listener starts");

    let (mut socket, _) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("ws handshake");
    socket
        .send(Message::Binary(vec![opcode::LOG_IN, 0x00].into()))
        .await
        .expect("send login");
    let _ = socket.next().await.expect("login reply").expect("frame");
    assert_eq!(ctx.registry.len(), 1);

    let game = ctx.games.by_name("default").expect("default game");
    let joined = support::wait_until(|| game.session_count() == 1, 2_000).await;
    assert!(joined, "session should join the game after login");

    socket.close(None).await.expect("client close");
    drop(socket);

    // The driver fires DISCONNECT and closes the session; the game set
    // empties even though the registry entry waits for its TTL.
    let left = support::wait_until(|| game.session_count() == 0, 2_000).await;
    assert!(left, "session should leave the game on disconnect");

    server.stop().await;
}
