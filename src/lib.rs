//! zeal — a message-oriented realtime game server runtime.
//!
//! The runtime accepts concurrent client connections over several wire
//! protocols (length-framed binary, JSON and SBE-style TCP, binary
//! WebSocket), authenticates each through a pluggable credentials verifier,
//! binds it to a long-lived player session, and routes traffic through a
//! shard-parallel event dispatcher into per-game handler code.
//!
//! Game rules live outside this crate: consumers register [`EventHandler`]s
//! and [`game::GameListener`]s, hand a [`auth::CredentialsVerifier`] to the
//! [`Runtime`], and call [`Runtime::start`].

pub mod auth;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod game;
pub mod id;
pub mod login;
pub mod net;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod session;

pub use auth::{AuthError, Credentials, CredentialsVerifier, TokenFabric};
pub use buffer::ByteBuf;
pub use codec::CodecError;
pub use config::{ConfigSource, EnvSource, MapSource, ServerConfig};
pub use dispatcher::{DispatcherSettings, EventDispatcher, EventHandler, HandlerError};
pub use event::{Event, NetworkEvent, Payload, opcode};
pub use game::{Game, GameId, GameListener, Games, SessionFactory};
pub use id::{IdGenerator, SessionId};
pub use net::{NetError, ServerContext, ServerManager};
pub use pipeline::Pipeline;
pub use protocol::{
    BinaryTcpProtocol, JsonTcpProtocol, Protocol, SbeProtocol, WebSocketProtocol,
};
pub use registry::{RegistrySettings, RegistryStats, RemovalCause, SessionRegistry};
pub use runtime::Runtime;
pub use session::{MessageSender, PlayerSession, Session, SessionStatus};
