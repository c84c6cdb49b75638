// End-to-end login flows over the length-framed TCP protocols.

mod support;

use std::sync::{Arc, Weak};
use support::{FixedKeyVerifier, FrameClient, RejectVerifier, start_tcp, test_context};

use zeal::dispatcher::{EventHandler, HandlerError};
use zeal::event::{Event, opcode};
use zeal::game::GameListener;
use zeal::id::SessionId;
use zeal::protocol::{BinaryTcpProtocol, JsonTcpProtocol, SbeProtocol};
use zeal::session::PlayerSession;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_binary_login_round_trip() {
    let ctx = test_context(Arc::new(FixedKeyVerifier {
        key: "abcdefgh".into(),
    }));
    let (server, addr) = start_tcp(ctx.clone(), Arc::new(BinaryTcpProtocol)).await;

    let mut client = FrameClient::connect(addr).await;
    // Literal wire form: length=2, opcode=LOG_IN, one payload byte.
    client.send_raw(&[0x00, 0x02, 0x01, 0x00]).await;

    let reply = client.read_frame().await.expect("login reply");
    assert_eq!(reply[0], opcode::LOG_IN_SUCCESS);
    let token = std::str::from_utf8(&reply[1..]).expect("token is utf8");
    assert!(!token.is_empty());
    // URL-safe base64 without padding.
    assert!(
        token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    );
    assert_eq!(ctx.fabric.verify(token).expect("token decrypts"), "abcdefgh");
    assert_eq!(ctx.registry.len(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn json_login_failure_sends_one_failure_frame_and_closes() {
    let ctx = test_context(Arc::new(RejectVerifier));
    let (server, addr) = start_tcp(ctx.clone(), Arc::new(JsonTcpProtocol)).await;

    let mut client = FrameClient::connect(addr).await;
    let mut body = vec![opcode::LOG_IN];
    body.extend_from_slice(br#"{"user":"someone","password":"nope"}"#);
    client.send_frame(&body).await;

    let reply = client.read_frame().await.expect("failure reply");
    assert_eq!(reply[0], opcode::LOG_IN_FAILURE);
    assert!(client.read_eof().await, "connection should close after failure");
    assert_eq!(ctx.registry.len(), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relogin_kicks_the_previous_connection() {
    let ctx = test_context(Arc::new(FixedKeyVerifier {
        key: "abcdefgh".into(),
    }));
    let (server, addr) = start_tcp(ctx.clone(), Arc::new(BinaryTcpProtocol)).await;

    let mut first = FrameClient::connect(addr).await;
    first.send_frame(&[opcode::LOG_IN, 0x00]).await;
    let reply = first.read_frame().await.expect("first login reply");
    assert_eq!(reply[0], opcode::LOG_IN_SUCCESS);

    let mut second = FrameClient::connect(addr).await;
    second.send_frame(&[opcode::LOG_IN, 0x00]).await;
    let reply = second.read_frame().await.expect("second login reply");
    assert_eq!(reply[0], opcode::LOG_IN_SUCCESS);

    // The displaced connection sees a LOG_OUT frame, then EOF.
    let kicked = first.read_frame().await.expect("log out frame");
    assert_eq!(kicked[0], opcode::LOG_OUT);
    assert!(first.read_eof().await, "first connection should be closed");
    assert_eq!(ctx.registry.len(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sbe_login_with_mismatched_schema_still_succeeds() {
    let ctx = test_context(Arc::new(FixedKeyVerifier {
        key: "abcdefgh".into(),
    }));
    let (server, addr) = start_tcp(ctx.clone(), Arc::new(SbeProtocol)).await;

    let mut client = FrameClient::connect(addr).await;
    // SBE header with schemaId=2 (mismatch, logged but tolerated):
    // blockLength=1, templateId=LOG_IN, schemaId=2, version=1, 1 payload byte.
    let body = [
        0x01, 0x00, // blockLength
        0x01, 0x00, // templateId -> LOG_IN
        0x02, 0x00, // schemaId (mismatch)
        0x01, 0x00, // version
        0x00, // payload
    ];
    client.send_frame(&body).await;

    let reply = client.read_frame().await.expect("sbe login reply");
    // Reply header: LE template id low byte is the opcode.
    assert_eq!(reply[2], opcode::LOG_IN_SUCCESS);
    assert_eq!(u16::from_le_bytes([reply[4], reply[5]]), 1, "schema id");
    let block_len = usize::from(u16::from_le_bytes([reply[0], reply[1]]));
    let token = std::str::from_utf8(&reply[8..8 + block_len]).expect("token utf8");
    assert_eq!(ctx.fabric.verify(token).expect("token decrypts"), "abcdefgh");
    assert_eq!(ctx.registry.len(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn logout_closes_session_and_empties_registry() {
    let ctx = test_context(Arc::new(FixedKeyVerifier {
        key: "abcdefgh".into(),
    }));
    let (server, addr) = start_tcp(ctx.clone(), Arc::new(BinaryTcpProtocol)).await;

    let mut client = FrameClient::connect(addr).await;
    client.send_frame(&[opcode::LOG_IN, 0x00]).await;
    client.read_frame().await.expect("login reply");
    assert_eq!(ctx.registry.len(), 1);

    client.send_frame(&[opcode::LOG_OUT]).await;
    assert!(client.read_eof().await, "server closes after logout");
    let emptied = support::wait_until(|| ctx.registry.len() == 0, 2_000).await;
    assert!(emptied, "registry entry should be removed on logout");

    server.stop().await;
}

// Echoes session messages back as network messages, exercising the full
// decode → dispatch → session handler → encode loop.
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

    fn name(&self) -> &str {
        "echo"
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
async fn session_messages_flow_through_the_dispatcher_and_back() {
    let ctx = test_context(Arc::new(FixedKeyVerifier {
        key: "abcdefgh".into(),
    }));
    let game = ctx.games.by_name("default").expect("default game");
    game.set_listener(Arc::new(EchoOnLogin));
    let (server, addr) = start_tcp(ctx.clone(), Arc::new(BinaryTcpProtocol)).await;

    let mut client = FrameClient::connect(addr).await;
    client.send_frame(&[opcode::LOG_IN, 0x00]).await;
    client.read_frame().await.expect("login reply");

    let mut body = vec![opcode::SESSION_MESSAGE];
    body.extend_from_slice(b"marco");
    client.send_frame(&body).await;

    let echoed = client.read_frame().await.expect("echo reply");
    assert_eq!(echoed[0], opcode::NETWORK_MESSAGE);
    assert_eq!(&echoed[1..], b"marco");

    // Ordering: a burst echoes back in publish order.
    for i in 0..5u8 {
        client.send_frame(&[opcode::SESSION_MESSAGE, i]).await;
    }
    for i in 0..5u8 {
        let echoed = client.read_frame().await.expect("burst echo");
        assert_eq!(echoed[1], i);
    }

    server.stop().await;
}
