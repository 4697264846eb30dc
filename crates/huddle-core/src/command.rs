//! Commands accepted by the coordinators and the errors they report.

use crate::presence::StoreError;
use thiserror::Error;

pub use huddle_protocol::line::Command;

/// A request handled by a cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCommand {
    /// Register `user` cluster-wide and bind it to the requesting session.
    Connect { user: String },
    /// Publish chat text as `user`.
    Chat { user: String, text: String },
    /// Drop `user`'s presence record.
    Disconnect { user: String },
    /// List connected usernames.
    ListUsers,
}

impl ClusterCommand {
    /// Short name used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterCommand::Connect { .. } => "connect",
            ClusterCommand::Chat { .. } => "chat",
            ClusterCommand::Disconnect { .. } => "disconnect",
            ClusterCommand::ListUsers => "list_users",
        }
    }
}

/// Successful result of a [`ClusterCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterReply {
    /// The command took effect.
    Done,
    /// Usernames, sorted.
    Users(Vec<String>),
}

/// Errors reported to the session that sent a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("<name> is required as a parameter for /name command")]
    NameRequired,

    #[error("<room name> is required as a parameter for /join command")]
    RoomRequired,

    #[error("<message> required as parameter in /msg command")]
    MessageRequired,

    #[error("join a room before sending messages")]
    NotInRoom,

    #[error("<user> is required")]
    UserRequired,

    /// The username already has a live presence record.
    #[error("user already exists and is connected. choose another username")]
    Duplicate(String),

    /// The user has no presence record.
    #[error("{0} is not connected")]
    NotConnected(String),

    /// The presence store or bus failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The coordinator has stopped.
    #[error("coordinator is shut down")]
    Closed,
}

impl CommandError {
    /// Whether this is a missing-argument error.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CommandError::NameRequired
                | CommandError::RoomRequired
                | CommandError::MessageRequired
                | CommandError::NotInRoom
                | CommandError::UserRequired
        )
    }
}
