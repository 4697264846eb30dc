//! Sessions and their outbound sinks.

use crate::message::Message;
use huddle_protocol::line::{Reply, DEFAULT_NAME};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// A session identifier, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh session ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

/// Something the coordinator asks ingress to write to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A reply to a command the session sent.
    Reply(Reply),
    /// A broadcast message.
    Message(Arc<Message>),
    /// Close the underlying connection after everything queued before it.
    Close,
}

/// The sending half of a session's outbound queue.
pub type Sink = mpsc::Sender<Outbound>;

/// Create a bounded outbound queue for one session.
#[must_use]
pub fn outbox(capacity: usize) -> (Sink, mpsc::Receiver<Outbound>) {
    mpsc::channel(capacity.max(1))
}

/// Coordinator-side state of a connected participant.
#[derive(Debug)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Current display name.
    pub name: String,
    /// Room the session is a member of.
    pub room: Option<String>,
    sink: Sink,
}

impl Session {
    /// Create an anonymous session writing to `sink`.
    #[must_use]
    pub fn new(id: SessionId, sink: Sink) -> Self {
        Self {
            id,
            name: DEFAULT_NAME.to_string(),
            room: None,
            sink,
        }
    }

    /// The session's outbound sink.
    #[must_use]
    pub fn sink(&self) -> &Sink {
        &self.sink
    }
}
