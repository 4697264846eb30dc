//! The local line protocol.
//!
//! Each input line is `<token> [args...]`, split on single spaces. Replies
//! are newline-terminated and prefixed `> ` on success or `err: ` on failure.
//! Parsing checks framing only: a missing argument still yields a command,
//! and the coordinator reports it.

use std::fmt;
use thiserror::Error;

/// Display name of a session before `/name`.
pub const DEFAULT_NAME: &str = "anonymous";

/// A typed local command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/name <name>`
    SetName { name: Option<String> },
    /// `/join <room>`
    JoinRoom { room: Option<String> },
    /// `/rooms`
    ListRooms,
    /// `/msg <text...>`
    SendMessage { text: Option<String> },
    /// `/quit`
    Quit,
}

impl Command {
    /// Short name used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Command::SetName { .. } => "name",
            Command::JoinRoom { .. } => "join",
            Command::ListRooms => "rooms",
            Command::SendMessage { .. } => "msg",
            Command::Quit => "quit",
        }
    }
}

/// Line parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The leading token is not a known command.
    #[error("unknown command: {0}")]
    Unknown(String),
}

/// Parse one input line into a command.
///
/// # Errors
///
/// Returns [`ParseError::Unknown`] if the leading token is not recognized.
pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
    let mut args = line.split(' ');
    let token = args.next().unwrap_or_default().trim();

    let first = |args: &mut std::str::Split<'_, char>| {
        args.next().filter(|a| !a.is_empty()).map(str::to_owned)
    };

    match token {
        "/name" => Ok(Command::SetName {
            name: first(&mut args),
        }),
        "/join" => Ok(Command::JoinRoom {
            room: first(&mut args),
        }),
        "/rooms" => Ok(Command::ListRooms),
        "/msg" => {
            let text = args.collect::<Vec<_>>().join(" ");
            Ok(Command::SendMessage {
                text: (!text.trim().is_empty()).then_some(text),
            })
        }
        "/quit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

/// A reply line sent to a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Rendered as `> <text>`.
    Ok(String),
    /// Rendered as `err: <text>`.
    Err(String),
}

impl Reply {
    /// Create a success reply.
    #[must_use]
    pub fn ok(text: impl Into<String>) -> Self {
        Reply::Ok(text.into())
    }

    /// Create a failure reply.
    #[must_use]
    pub fn err(text: impl Into<String>) -> Self {
        Reply::Err(text.into())
    }

    /// Render the reply as a wire line, including the trailing newline.
    #[must_use]
    pub fn render(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(text) => write!(f, "> {text}"),
            Reply::Err(text) => write!(f, "err: {text}"),
        }
    }
}
