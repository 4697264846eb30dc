//! The local session coordinator.
//!
//! One task owns every session and room. Producers (one per connection)
//! submit commands through a bounded queue and the task applies them one at
//! a time, so room state needs no locks and the order in which commands
//! reach the queue is the order every observer sees.

use crate::command::{Command, CommandError};
use crate::fanout::{self, deliver, Delivery, FanoutReport};
use crate::message::Message;
use crate::room::Room;
use crate::session::{Outbound, Session, SessionId, Sink};
use huddle_protocol::line::Reply;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Coordinator errors seen by producers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The coordinator task has stopped.
    #[error("coordinator is shut down")]
    Closed,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capacity of the command queue. Producers wait when it is full.
    pub queue_capacity: usize,
    /// Remove a room as soon as its last member leaves.
    pub reclaim_empty_rooms: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            reclaim_empty_rooms: false,
        }
    }
}

/// Point-in-time view of the room table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    /// Room name to member display names, ordered by session ID.
    pub rooms: BTreeMap<String, Vec<String>>,
    /// Number of attached sessions.
    pub sessions: usize,
}

enum Envelope {
    Attach { session: SessionId, sink: Sink },
    Command { session: SessionId, command: Command },
    Detach { session: SessionId },
    Notify { session: SessionId, reply: Reply },
    Snapshot { reply: oneshot::Sender<RoomSnapshot> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable producer side of the coordinator queue.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Envelope::Attach { session, .. } => write!(f, "Attach({session})"),
            Envelope::Command { session, command } => write!(f, "Command({session}, {command:?})"),
            Envelope::Detach { session } => write!(f, "Detach({session})"),
            Envelope::Notify { session, reply } => write!(f, "Notify({session}, {reply})"),
            Envelope::Snapshot { .. } => f.write_str("Snapshot"),
            Envelope::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl CoordinatorHandle {
    async fn send(&self, envelope: Envelope) -> Result<(), CoordinatorError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| CoordinatorError::Closed)
    }

    /// Register a new anonymous session writing to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the coordinator has stopped.
    pub async fn attach(&self, sink: Sink) -> Result<SessionId, CoordinatorError> {
        let session = SessionId::next();
        self.send(Envelope::Attach { session, sink }).await?;
        Ok(session)
    }

    /// Queue a command from `session`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the coordinator has stopped.
    pub async fn submit(&self, session: SessionId, command: Command) -> Result<(), CoordinatorError> {
        self.send(Envelope::Command { session, command }).await
    }

    /// Remove a session whose connection ended without `/quit`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the coordinator has stopped.
    pub async fn detach(&self, session: SessionId) -> Result<(), CoordinatorError> {
        self.send(Envelope::Detach { session }).await
    }

    /// Queue a reply to `session`, ordered after its earlier commands.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the coordinator has stopped.
    pub async fn notify(&self, session: SessionId, reply: Reply) -> Result<(), CoordinatorError> {
        self.send(Envelope::Notify { session, reply }).await
    }

    /// Take a snapshot of the room table, ordered after every queued command.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the coordinator has stopped.
    pub async fn snapshot(&self) -> Result<RoomSnapshot, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::Snapshot { reply }).await?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }

    /// Drain every queued command, close all sessions and stop.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the coordinator had already stopped.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::Shutdown { reply }).await?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }

    /// Whether the coordinator has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The coordinator task state.
pub struct Coordinator {
    config: CoordinatorConfig,
    sessions: HashMap<SessionId, Session>,
    rooms: BTreeMap<String, Room>,
    rx: mpsc::Receiver<Envelope>,
}

impl Coordinator {
    /// Start a coordinator task.
    #[must_use]
    pub fn spawn(config: CoordinatorConfig) -> (CoordinatorHandle, JoinHandle<()>) {
        info!("Starting coordinator with config: {:?}", config);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let coordinator = Self {
            config,
            sessions: HashMap::new(),
            rooms: BTreeMap::new(),
            rx,
        };
        (CoordinatorHandle { tx }, tokio::spawn(coordinator.run()))
    }

    async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            match envelope {
                Envelope::Attach { session, sink } => {
                    debug!(session = %session, "Session attached");
                    self.sessions.insert(session, Session::new(session, sink));
                }
                Envelope::Command { session, command } => self.apply(session, command),
                Envelope::Detach { session } => self.detach(session),
                Envelope::Notify { session, reply } => self.reply(session, reply),
                Envelope::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Envelope::Shutdown { reply } => {
                    self.close_all();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!(rooms = self.rooms.len(), "Coordinator stopped");
    }

    fn apply(&mut self, session: SessionId, command: Command) {
        if !self.sessions.contains_key(&session) {
            debug!(session = %session, command = command.kind(), "Ignoring command for removed session");
            return;
        }

        let kind = command.kind();
        let result = match command {
            Command::SetName { name } => self.set_name(session, name),
            Command::JoinRoom { room } => self.join(session, room),
            Command::ListRooms => {
                self.list_rooms(session);
                Ok(())
            }
            Command::SendMessage { text } => self.send_message(session, text),
            Command::Quit => {
                self.quit(session);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(session = %session, command = kind, error = %e, "Command rejected");
            self.reply(session, Reply::err(e.to_string()));
        }
    }

    fn set_name(&mut self, id: SessionId, name: Option<String>) -> Result<(), CommandError> {
        let name = name.ok_or(CommandError::NameRequired)?;
        if let Some(session) = self.sessions.get_mut(&id) {
            session.name = name.clone();
        }
        self.reply(id, Reply::ok(format!("Hello {name}")));
        Ok(())
    }

    fn join(&mut self, id: SessionId, room: Option<String>) -> Result<(), CommandError> {
        let room_name = room.ok_or(CommandError::RoomRequired)?;

        // Leave strictly before join, so nobody observes two memberships.
        self.leave_room(id);

        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };
        session.room = Some(room_name.clone());
        let name = session.name.clone();

        self.rooms
            .entry(room_name.clone())
            .or_insert_with(|| {
                debug!(room = %room_name, "Creating room");
                Room::new(room_name.clone())
            })
            .join(id);

        self.broadcast_room(
            &room_name,
            Some(id),
            Message::notice(&room_name, format!("{name} joined the room")),
        );
        self.reply(id, Reply::ok(format!("you joined {room_name}")));
        Ok(())
    }

    fn list_rooms(&self, id: SessionId) {
        let names: Vec<&str> = self.rooms.keys().map(String::as_str).collect();
        self.reply(id, Reply::ok(format!("rooms: {}", names.join(", "))));
    }

    fn send_message(&mut self, id: SessionId, text: Option<String>) -> Result<(), CommandError> {
        let text = text.ok_or(CommandError::MessageRequired)?;
        let session = self.sessions.get(&id).ok_or(CommandError::NotInRoom)?;
        let room = session.room.clone().ok_or(CommandError::NotInRoom)?;
        let message = Message::chat(&room, session.name.clone(), text);
        self.broadcast_room(&room, Some(id), message);
        Ok(())
    }

    fn quit(&mut self, id: SessionId) {
        if let Some(room) = self.leave_room(id) {
            self.reply(id, Reply::ok(format!("you left the room: {room}")));
        }
        self.reply(id, Reply::ok("closing connection"));
        if let Some(session) = self.sessions.remove(&id) {
            deliver(session.sink(), Outbound::Close);
            debug!(session = %id, "Session quit");
        }
    }

    fn detach(&mut self, id: SessionId) {
        self.leave_room(id);
        if self.sessions.remove(&id).is_some() {
            debug!(session = %id, "Session detached");
        }
    }

    /// Remove `id` from its current room and tell the remaining members.
    ///
    /// Returns the name of the room that was left.
    fn leave_room(&mut self, id: SessionId) -> Option<String> {
        let session = self.sessions.get_mut(&id)?;
        let room_name = session.room.take()?;
        let name = session.name.clone();

        if let Some(room) = self.rooms.get_mut(&room_name) {
            room.leave(id);
        }
        self.broadcast_room(
            &room_name,
            Some(id),
            Message::notice(&room_name, format!("{name} left")),
        );

        if self.config.reclaim_empty_rooms
            && self.rooms.get(&room_name).is_some_and(Room::is_empty)
        {
            self.rooms.remove(&room_name);
            debug!(room = %room_name, "Deleted empty room");
        }

        Some(room_name)
    }

    fn broadcast_room(&self, room_name: &str, except: Option<SessionId>, message: Message) -> FanoutReport {
        let Some(room) = self.rooms.get(room_name) else {
            warn!(room = %room_name, "Broadcast to non-existent room");
            return FanoutReport::default();
        };
        let recipients = room.members().filter_map(|member| self.sessions.get(&member));
        fanout::broadcast(recipients, except, message)
    }

    fn reply(&self, id: SessionId, reply: Reply) {
        if let Some(session) = self.sessions.get(&id) {
            let delivery = deliver(session.sink(), Outbound::Reply(reply));
            if delivery != Delivery::Queued {
                warn!(session = %id, outcome = ?delivery, "Dropped reply");
            }
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        let rooms = self
            .rooms
            .iter()
            .map(|(name, room)| {
                let members = room
                    .members()
                    .filter_map(|member| self.sessions.get(&member))
                    .map(|session| session.name.clone())
                    .collect();
                (name.clone(), members)
            })
            .collect();
        RoomSnapshot {
            rooms,
            sessions: self.sessions.len(),
        }
    }

    fn close_all(&mut self) {
        info!(sessions = self.sessions.len(), "Closing all sessions");
        for (_, session) in self.sessions.drain() {
            deliver(
                session.sink(),
                Outbound::Reply(Reply::ok("server shutting down")),
            );
            deliver(session.sink(), Outbound::Close);
        }
        for room in self.rooms.values_mut() {
            let members: Vec<SessionId> = room.members().collect();
            for member in members {
                room.leave(member);
            }
        }
    }
}
