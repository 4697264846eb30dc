//! Message envelopes delivered to sessions.

use std::fmt;

/// Where a message is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every member of one room.
    Room(String),
    /// Every session attached to a cluster node.
    Global,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Room(name) => write!(f, "room:{name}"),
            Scope::Global => f.write_str("global"),
        }
    }
}

/// A message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Delivery scope.
    pub scope: Scope,
    /// Display name of the sender. `None` for notices and bus lines.
    pub sender: Option<String>,
    /// Message text.
    pub text: String,
}

impl Message {
    fn new(scope: Scope, sender: Option<String>, text: String) -> Self {
        Self {
            scope,
            sender,
            text,
        }
    }

    /// Chat text written by `sender` in `room`.
    #[must_use]
    pub fn chat(room: impl Into<String>, sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Scope::Room(room.into()), Some(sender.into()), text.into())
    }

    /// A membership notice in `room`, such as `Alice joined the room`.
    #[must_use]
    pub fn notice(room: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Scope::Room(room.into()), None, text.into())
    }

    /// One line received from the cluster bus.
    #[must_use]
    pub fn bus_line(text: impl Into<String>) -> Self {
        Self::new(Scope::Global, None, text.into())
    }

    /// The text a recipient sees, without any reply prefix.
    #[must_use]
    pub fn body(&self) -> String {
        match &self.sender {
            Some(sender) => format!("{sender}: {}", self.text),
            None => self.text.clone(),
        }
    }
}
