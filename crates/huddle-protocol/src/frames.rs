//! Frame types for the Huddle protocol.
//!
//! Two conversations share one frame vocabulary:
//!
//! - cluster clients talk to a node: `Connect`, `Chat`, `Disconnect`,
//!   `ListUsers`, answered by `Ack`, `Users` or `Error`
//! - nodes talk to the hub: `Claim`, `Exists`, `Owner`, `Release`,
//!   `ReleaseIf`, `Scan`, `Publish`, `Subscribe`, answered by `Flag`,
//!   `Value`, `Page`, `Ack` or `Error`
//!
//! Every request carries an `id` that its reply echoes. `Line` is the only
//! unsolicited frame: one bus line pushed to a subscriber.

use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The username already has a live presence record.
    pub const DUPLICATE: u16 = 1001;
    /// The user has no presence record.
    pub const NOT_CONNECTED: u16 = 1002;
    /// A required argument was missing.
    pub const INVALID: u16 = 1003;
    /// The presence store or bus failed.
    pub const STORE: u16 = 1004;
    /// The node is shutting down.
    pub const UNAVAILABLE: u16 = 1005;
    /// The frame is not valid in this conversation.
    pub const UNEXPECTED: u16 = 1006;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Chat = 0x02,
    Disconnect = 0x03,
    ListUsers = 0x04,
    Claim = 0x10,
    Exists = 0x11,
    Release = 0x12,
    Scan = 0x13,
    Publish = 0x14,
    Subscribe = 0x15,
    Owner = 0x16,
    ReleaseIf = 0x17,
    Ack = 0x20,
    Users = 0x21,
    Flag = 0x22,
    Page = 0x23,
    Error = 0x24,
    Value = 0x25,
    Line = 0x30,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Register a username cluster-wide.
    #[serde(rename = "connect")]
    Connect { id: u64, user: String },

    /// Send chat text as a connected user.
    #[serde(rename = "chat")]
    Chat {
        id: u64,
        user: String,
        text: String,
    },

    /// Drop a username's presence record.
    #[serde(rename = "disconnect")]
    Disconnect { id: u64, user: String },

    /// List connected usernames.
    #[serde(rename = "list_users")]
    ListUsers { id: u64 },

    /// Create `key` only if it does not exist.
    #[serde(rename = "claim")]
    Claim { id: u64, key: String, value: String },

    /// Check whether `key` exists.
    #[serde(rename = "exists")]
    Exists { id: u64, key: String },

    /// Fetch the value stored under `key`.
    #[serde(rename = "owner")]
    Owner { id: u64, key: String },

    /// Delete `key`.
    #[serde(rename = "release")]
    Release { id: u64, key: String },

    /// Delete `key` only while it holds `value`.
    #[serde(rename = "release_if")]
    ReleaseIf { id: u64, key: String, value: String },

    /// Fetch one page of keys starting with `prefix`, strictly after `after`.
    #[serde(rename = "scan")]
    Scan {
        id: u64,
        prefix: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        after: Option<String>,
        count: u32,
    },

    /// Publish a line on the global bus channel.
    #[serde(rename = "publish")]
    Publish { id: u64, line: String },

    /// Start receiving `Line` frames for the global bus channel.
    #[serde(rename = "subscribe")]
    Subscribe { id: u64 },

    /// Request succeeded with no payload.
    #[serde(rename = "ack")]
    Ack { id: u64 },

    /// Reply to `ListUsers`.
    #[serde(rename = "users")]
    Users { id: u64, users: Vec<String> },

    /// Boolean reply to `Claim`, `Exists`, `Release` and `ReleaseIf`.
    #[serde(rename = "flag")]
    Flag { id: u64, value: bool },

    /// Reply to `Owner`. `None` if the key does not exist.
    #[serde(rename = "value")]
    Value { id: u64, value: Option<String> },

    /// Reply to `Scan`. `next` is `None` once the scan is complete.
    #[serde(rename = "page")]
    Page {
        id: u64,
        keys: Vec<String>,
        next: Option<String>,
    },

    /// Request failed.
    #[serde(rename = "error")]
    Error { id: u64, code: u16, message: String },

    /// One bus line.
    #[serde(rename = "line")]
    Line { text: String },
}

impl Frame {
    /// Create an ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create an error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a bus line frame.
    #[must_use]
    pub fn line(text: impl Into<String>) -> Self {
        Frame::Line { text: text.into() }
    }

    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Chat { .. } => FrameType::Chat,
            Frame::Disconnect { .. } => FrameType::Disconnect,
            Frame::ListUsers { .. } => FrameType::ListUsers,
            Frame::Claim { .. } => FrameType::Claim,
            Frame::Exists { .. } => FrameType::Exists,
            Frame::Owner { .. } => FrameType::Owner,
            Frame::Release { .. } => FrameType::Release,
            Frame::ReleaseIf { .. } => FrameType::ReleaseIf,
            Frame::Scan { .. } => FrameType::Scan,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Users { .. } => FrameType::Users,
            Frame::Flag { .. } => FrameType::Flag,
            Frame::Page { .. } => FrameType::Page,
            Frame::Error { .. } => FrameType::Error,
            Frame::Value { .. } => FrameType::Value,
            Frame::Line { .. } => FrameType::Line,
        }
    }

    /// The request id this frame carries, if any.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match self {
            Frame::Connect { id, .. }
            | Frame::Chat { id, .. }
            | Frame::Disconnect { id, .. }
            | Frame::ListUsers { id }
            | Frame::Claim { id, .. }
            | Frame::Exists { id, .. }
            | Frame::Owner { id, .. }
            | Frame::Release { id, .. }
            | Frame::ReleaseIf { id, .. }
            | Frame::Scan { id, .. }
            | Frame::Publish { id, .. }
            | Frame::Subscribe { id }
            | Frame::Ack { id }
            | Frame::Users { id, .. }
            | Frame::Flag { id, .. }
            | Frame::Page { id, .. }
            | Frame::Value { id, .. }
            | Frame::Error { id, .. } => Some(*id),
            Frame::Line { .. } => None,
        }
    }
}
