//! # huddle-protocol
//!
//! Wire formats spoken by Huddle.
//!
//! - **Line protocol** - the local, newline-terminated text protocol
//!   (`/name`, `/join`, `/rooms`, `/msg`, `/quit`)
//! - **Frames** - MessagePack frames used by the cluster RPC ingress and by
//!   the hub that hosts the shared presence store and bus
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, line, Frame};
//!
//! let command = line::parse_line("/join lobby").unwrap();
//! assert_eq!(command, line::Command::JoinRoom { room: Some("lobby".into()) });
//!
//! let frame = Frame::Connect { id: 1, user: "bob".into() };
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod line;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType};
pub use line::{parse_line, Command, ParseError, Reply};
