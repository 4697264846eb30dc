//! Rooms: named sets of sessions that receive each other's messages.

use crate::session::SessionId;
use std::collections::BTreeSet;
use tracing::debug;

/// A chat room.
#[derive(Debug)]
pub struct Room {
    name: String,
    members: BTreeSet<SessionId>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
        }
    }

    /// Add a session to this room.
    ///
    /// Returns `true` if the session was not already a member.
    pub fn join(&mut self, session: SessionId) -> bool {
        let added = self.members.insert(session);
        if added {
            debug!(room = %self.name, session = %session, "Session joined room");
        }
        added
    }

    /// Remove a session from this room.
    ///
    /// Returns `true` if the session was a member.
    pub fn leave(&mut self, session: SessionId) -> bool {
        let removed = self.members.remove(&session);
        if removed {
            debug!(room = %self.name, session = %session, "Session left room");
        }
        removed
    }

    /// Iterate members in session order.
    pub fn members(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.members.iter().copied()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
