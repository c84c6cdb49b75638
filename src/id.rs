//! Session id allocation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a session. Numeric when the node has no name, otherwise the
/// node name plus a per-process sequence (`"{node}-{seq}"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionId {
    Seq(u64),
    Named(Arc<str>),
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::Seq(n) => write!(f, "{n}"),
            SessionId::Named(s) => f.write_str(s),
        }
    }
}

/// Process-wide id allocator: a single atomic counter plus an optional node
/// prefix. Exposed as a value so tests can reset it.
#[derive(Debug)]
pub struct IdGenerator {
    counter: AtomicU64,
    node: Option<Arc<str>>,
}

impl IdGenerator {
    pub fn new(node_name: &str) -> Self {
        let node = if node_name.is_empty() {
            None
        } else {
            Some(Arc::from(node_name))
        };
        Self {
            counter: AtomicU64::new(0),
            node,
        }
    }

    pub fn next_id(&self) -> SessionId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        match &self.node {
            None => SessionId::Seq(seq),
            Some(node) => SessionId::Named(Arc::from(format!("{node}-{seq}"))),
        }
    }

    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }
}
