//! # huddle-transport
//!
//! Transports for the Huddle chat server.
//!
//! - **Lines** - Newline-delimited text over TCP (local mode, line client)
//! - **WebSocket** - Length-prefixed MessagePack frames (cluster RPC, hub)
//!
//! Both connection types split into an independently owned reading half
//! and writing half, so a session can read and write from separate tasks.

pub mod error;
pub mod lines;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use error::{ConnectionId, TransportError};
pub use lines::{LineConnection, LineListener, LineReader, LineWriter};

#[cfg(feature = "websocket")]
pub use websocket::{FrameReceiver, FrameSender, WebSocketConnection};
