//! # huddle-core
//!
//! Session coordination for the Huddle chat server.
//!
//! This crate provides the two coordinator flavors and their building blocks:
//!
//! - **Coordinator** - Single-node rooms, driven by line commands
//! - **ClusterNode** - Multi-node presence and a global bus
//! - **Room** - Membership set of one chat room
//! - **Fanout** - Non-blocking delivery to session sinks
//! - **Presence** - Shared store and bus traits, plus an in-memory hub
//! - **Bridge** - Bus subscription feeding a cluster node
//! - **Shutdown** - Cancellation token and task tracking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  queue  ┌─────────────┐     ┌─────────────┐
//! │  Producers  │────────▶│ Coordinator │────▶│    Rooms    │
//! └─────────────┘         └─────────────┘     └─────────────┘
//!        ▲                       │
//!        │      try_send         ▼
//!  ┌─────────────┐        ┌─────────────┐
//!  │   Writers   │◀───────│    Sinks    │
//!  └─────────────┘        └─────────────┘
//! ```

pub mod bridge;
pub mod cluster;
pub mod command;
pub mod coordinator;
pub mod fanout;
pub mod message;
pub mod presence;
pub mod room;
pub mod session;
pub mod shutdown;

pub use bridge::{BridgeConfig, BridgeError};
pub use cluster::{ClusterConfig, ClusterHandle, ClusterNode};
pub use command::{ClusterCommand, ClusterReply, Command, CommandError};
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorHandle, RoomSnapshot,
};
pub use message::{Message, Scope};
pub use presence::{Bus, MemoryHub, PresenceStore, ScanPage, StoreError, Subscription};
pub use session::{outbox, Outbound, SessionId, Sink};
pub use shutdown::ShutdownCoordinator;
