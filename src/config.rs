//! Read-only configuration access.
//!
//! Loading (files, `.env`, CLI flags) is the launcher's job; this module only
//! consumes a key→value view of whatever the launcher prepared.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::warn;

/// Read-only key→value provider consumed by the runtime.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process-environment backed source.
///
/// Keys are looked up verbatim first, then as their upper snake-case alias
/// (`server.tcp.enabled` → `SERVER_TCP_ENABLED`) so plain shells can set them.
#[derive(Debug, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        if let Ok(value) = std::env::var(key) {
            return Some(value);
        }
        let alias: String = key
            .chars()
            .map(|c| if c == '.' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        std::env::var(alias).ok()
    }
}

/// In-memory source used by tests and embedders.
#[derive(Debug, Default)]
pub struct MapSource {
    entries: HashMap<String, String>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

pub const KEY_TCP_ENABLED: &str = "server.tcp.enabled";
pub const KEY_TCP_PORT: &str = "tcp.port";
pub const KEY_HTTP_ENABLED: &str = "server.http.enabled";
pub const KEY_HTTP_PORT: &str = "http.port";
pub const KEY_WS_ENABLED: &str = "server.websocket.enabled";
pub const KEY_WS_PORT: &str = "web.socket.port";
pub const KEY_NODE_NAME: &str = "zeal.node";

/// Typed view over the listener and node-identity keys.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tcp_enabled: bool,
    pub tcp_port: u16,
    pub http_enabled: bool,
    pub http_port: u16,
    pub ws_enabled: bool,
    pub ws_port: u16,
    /// Empty means numeric session ids; non-empty prefixes ids as `{node}-{seq}`.
    pub node_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_enabled: true,
            tcp_port: 8090,
            http_enabled: true,
            http_port: 8081,
            ws_enabled: true,
            ws_port: 8300,
            node_name: String::new(),
        }
    }
}

impl ServerConfig {
    /// Reads the typed keys from the provided source, falling back to
    /// defaults (with a warning) on absent or unparseable values.
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();
        Self {
            tcp_enabled: read_bool(source, KEY_TCP_ENABLED, defaults.tcp_enabled),
            tcp_port: read_port(source, KEY_TCP_PORT, defaults.tcp_port),
            http_enabled: read_bool(source, KEY_HTTP_ENABLED, defaults.http_enabled),
            http_port: read_port(source, KEY_HTTP_PORT, defaults.http_port),
            ws_enabled: read_bool(source, KEY_WS_ENABLED, defaults.ws_enabled),
            ws_port: read_port(source, KEY_WS_PORT, defaults.ws_port),
            node_name: source.get(KEY_NODE_NAME).unwrap_or_default(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_source(&EnvSource)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        any_addr(self.tcp_port)
    }

    pub fn http_addr(&self) -> SocketAddr {
        any_addr(self.http_port)
    }

    pub fn ws_addr(&self) -> SocketAddr {
        any_addr(self.ws_port)
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

fn read_bool(source: &dyn ConfigSource, key: &str, default: bool) -> bool {
    match source.get(key) {
        None => default,
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            other => {
                warn!(key, value = other, "unparseable boolean config value; using default");
                default
            }
        },
    }
}

fn read_port(source: &dyn ConfigSource, key: &str, default: u16) -> u16 {
    match source.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                warn!(key, value = %raw, "unparseable port config value; using default");
                default
            }
        },
    }
}
