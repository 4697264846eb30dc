//! The cluster node.
//!
//! Each node runs one coordinator task that serializes RPC requests against
//! a shared [`PresenceStore`] and the global [`Bus`]. A [`Bridge`] task reads
//! the bus and queues every line back into the coordinator, which delivers
//! it to every session attached to this node, including the sender's own.
//!
//! ```text
//!  rpc session ──Connect/Chat/...──►┐
//!  rpc session ──────────────────►  ├─► coordinator ──claim/exists/release──► store
//!                                   │        │
//!  bridge ◄──── bus.subscribe ◄─────┼────────┴──publish──► bus
//!     └──Deliver(line)─────────────►┘
//! ```

use crate::bridge::{Bridge, BridgeConfig, BridgeError};
use crate::command::{ClusterCommand, ClusterReply, CommandError};
use crate::fanout::{self, deliver};
use crate::message::Message;
use crate::presence::{
    presence_key, scan_all, user_from_key, Bus, PresenceStore, StoreError, PRESENCE_PREFIX,
};
use crate::session::{Outbound, Session, SessionId, Sink};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cluster node configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Capacity of the coordinator queue.
    pub queue_capacity: usize,
    /// Page size for presence scans.
    pub scan_count: usize,
    /// Bus bridge retry policy.
    pub bridge: BridgeConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            scan_count: 100,
            bridge: BridgeConfig::default(),
        }
    }
}

type Responder = oneshot::Sender<Result<ClusterReply, CommandError>>;

static NODES_STARTED: AtomicU64 = AtomicU64::new(0);

/// An identifier for this node that other processes will not reuse.
fn node_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    let started = NODES_STARTED.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}-{:x}", std::process::id(), nanos, started)
}

/// A user this node claimed, and the token stored in their presence record.
#[derive(Debug)]
struct LocalClaim {
    session: Option<SessionId>,
    token: String,
}

enum Envelope {
    Attach {
        session: SessionId,
        sink: Sink,
    },
    Detach {
        session: SessionId,
    },
    Request {
        session: Option<SessionId>,
        command: ClusterCommand,
        reply: Responder,
    },
    Deliver {
        line: String,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable producer side of a cluster node's queue.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    tx: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Envelope::Attach { session, .. } => write!(f, "Attach({session})"),
            Envelope::Detach { session } => write!(f, "Detach({session})"),
            Envelope::Request { command, .. } => write!(f, "Request({})", command.kind()),
            Envelope::Deliver { .. } => f.write_str("Deliver"),
            Envelope::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl ClusterHandle {
    async fn send(&self, envelope: Envelope) -> Result<(), CommandError> {
        self.tx.send(envelope).await.map_err(|_| CommandError::Closed)
    }

    /// Register a session that receives every bus line.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] if the node has stopped.
    pub async fn attach(&self, sink: Sink) -> Result<SessionId, CommandError> {
        let session = SessionId::next();
        self.send(Envelope::Attach { session, sink }).await?;
        Ok(session)
    }

    /// Remove a session. Users it connected are disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] if the node has stopped.
    pub async fn detach(&self, session: SessionId) -> Result<(), CommandError> {
        self.send(Envelope::Detach { session }).await
    }

    /// Queue `command` and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns the command's own error, or [`CommandError::Closed`] if the
    /// node stopped before answering.
    pub async fn request(
        &self,
        session: Option<SessionId>,
        command: ClusterCommand,
    ) -> Result<ClusterReply, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::Request {
            session,
            command,
            reply,
        })
        .await?;
        rx.await.map_err(|_| CommandError::Closed)?
    }

    /// Claim `user` cluster-wide on behalf of `session`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Duplicate`] if the username is taken.
    pub async fn connect(
        &self,
        session: Option<SessionId>,
        user: impl Into<String>,
    ) -> Result<(), CommandError> {
        let user = user.into();
        self.request(session, ClusterCommand::Connect { user })
            .await
            .map(|_| ())
    }

    /// Publish chat text as `user`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotConnected`] if `user` has no presence record.
    pub async fn chat(
        &self,
        user: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), CommandError> {
        let command = ClusterCommand::Chat {
            user: user.into(),
            text: text.into(),
        };
        self.request(None, command).await.map(|_| ())
    }

    /// Drop `user`'s presence record, announcing the departure if it existed.
    ///
    /// # Errors
    ///
    /// Returns a store error if the store or bus fails.
    pub async fn disconnect(&self, user: impl Into<String>) -> Result<(), CommandError> {
        let user = user.into();
        self.request(None, ClusterCommand::Disconnect { user })
            .await
            .map(|_| ())
    }

    /// Every connected username, sorted.
    ///
    /// # Errors
    ///
    /// Returns a store error if a scan fails.
    pub async fn list_users(&self) -> Result<Vec<String>, CommandError> {
        match self.request(None, ClusterCommand::ListUsers).await? {
            ClusterReply::Users(users) => Ok(users),
            ClusterReply::Done => Ok(Vec::new()),
        }
    }

    /// Queue a bus line for delivery to every attached session.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] if the node has stopped.
    pub async fn deliver(&self, line: String) -> Result<(), CommandError> {
        self.send(Envelope::Deliver { line }).await
    }

    /// Drain the queue, announce local departures, close sessions and stop.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] if the node had already stopped.
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::Shutdown { reply }).await?;
        rx.await.map_err(|_| CommandError::Closed)
    }

    /// Whether the coordinator has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The cluster coordinator task state.
struct ClusterCoordinator {
    store: Arc<dyn PresenceStore>,
    bus: Arc<dyn Bus>,
    config: ClusterConfig,
    sessions: HashMap<SessionId, Session>,
    /// Users connected through this node.
    local: BTreeMap<String, LocalClaim>,
    node_id: String,
    claims: u64,
    rx: mpsc::Receiver<Envelope>,
}

impl ClusterCoordinator {
    async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            match envelope {
                Envelope::Attach { session, sink } => {
                    debug!(session = %session, "Session attached");
                    self.sessions.insert(session, Session::new(session, sink));
                }
                Envelope::Detach { session } => self.detach(session).await,
                Envelope::Request {
                    session,
                    command,
                    reply,
                } => {
                    let kind = command.kind();
                    let result = self.handle(session, command).await;
                    if let Err(e) = &result {
                        debug!(command = kind, error = %e, "Request failed");
                    }
                    let _ = reply.send(result);
                }
                Envelope::Deliver { line } => {
                    fanout::broadcast(self.sessions.values(), None, Message::bus_line(line));
                }
                Envelope::Shutdown { reply } => {
                    self.depart_all().await;
                    self.close_all();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!("Cluster coordinator stopped");
    }

    async fn handle(
        &mut self,
        session: Option<SessionId>,
        command: ClusterCommand,
    ) -> Result<ClusterReply, CommandError> {
        match command {
            ClusterCommand::Connect { user } => {
                let token = self.connect(session, &user).await?;
                if let Some(id) = session {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.name = user.clone();
                    }
                }
                self.local.insert(user, LocalClaim { session, token });
                Ok(ClusterReply::Done)
            }
            ClusterCommand::Chat { user, text } => {
                self.chat(&user, &text).await?;
                Ok(ClusterReply::Done)
            }
            ClusterCommand::Disconnect { user } => {
                self.disconnect(&user).await?;
                Ok(ClusterReply::Done)
            }
            ClusterCommand::ListUsers => Ok(ClusterReply::Users(self.list_users().await?)),
        }
    }

    /// Claim `user` and announce it. Returns the token stored in the record.
    async fn connect(
        &mut self,
        session: Option<SessionId>,
        user: &str,
    ) -> Result<String, CommandError> {
        if user.is_empty() {
            return Err(CommandError::UserRequired);
        }
        let key = presence_key(user);
        let token = self.claim_token(session);
        match self.store.claim(&key, &token).await {
            Ok(true) => {}
            Ok(false) => return Err(CommandError::Duplicate(user.to_string())),
            Err(e) => {
                // A claim that timed out may still have been applied.
                self.roll_back(user, &key, &token).await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.bus.publish(&format!("{user} connected.")).await {
            warn!(user, error = %e, "Connect notice failed, releasing claim");
            self.roll_back(user, &key, &token).await;
            return Err(e.into());
        }

        info!(user, "User connected");
        Ok(token)
    }

    fn claim_token(&mut self, session: Option<SessionId>) -> String {
        self.claims += 1;
        let session = session.map_or(0, |id| id.as_u64());
        format!("{}/{}/{}", self.node_id, session, self.claims)
    }

    /// Delete `key` if it still holds the claim made with `token`.
    async fn roll_back(&self, user: &str, key: &str, token: &str) {
        match self.store.release_if(key, token).await {
            Ok(true) => debug!(user, "Claim rolled back"),
            Ok(false) => {}
            Err(e) => warn!(user, error = %e, "Failed to release claim"),
        }
    }

    async fn chat(&self, user: &str, text: &str) -> Result<(), CommandError> {
        if user.is_empty() {
            return Err(CommandError::UserRequired);
        }
        if !self.store.exists(&presence_key(user)).await? {
            return Err(CommandError::NotConnected(user.to_string()));
        }
        self.bus.publish(&format!("> {user} : {text}")).await?;
        Ok(())
    }

    async fn disconnect(&mut self, user: &str) -> Result<(), CommandError> {
        if user.is_empty() {
            return Err(CommandError::UserRequired);
        }
        let key = presence_key(user);
        if self.store.exists(&key).await? {
            self.bus.publish(&format!("> {user}, left the chat")).await?;
            if !self.store.release(&key).await? {
                debug!(user, "Presence record already gone");
            }
            info!(user, "User disconnected");
        }
        self.local.remove(user);
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        let keys = scan_all(&*self.store, PRESENCE_PREFIX, self.config.scan_count).await?;
        let mut users: Vec<String> = keys
            .iter()
            .filter_map(|key| user_from_key(key))
            .map(str::to_string)
            .collect();
        users.sort();
        Ok(users)
    }

    /// Disconnect a local user, but only while the record is still ours.
    ///
    /// Someone else may have disconnected the user and claimed the name
    /// again; that record is left alone and nothing is announced.
    async fn depart(&mut self, user: &str) -> Result<(), CommandError> {
        let Some(claim) = self.local.remove(user) else {
            return Ok(());
        };
        let key = presence_key(user);
        if self.store.owner(&key).await?.as_deref() != Some(claim.token.as_str()) {
            debug!(user, "Claim no longer held, dropping local binding");
            return Ok(());
        }

        self.bus.publish(&format!("> {user}, left the chat")).await?;
        if !self.store.release_if(&key, &claim.token).await? {
            debug!(user, "Presence record already gone");
        }
        info!(user, "User disconnected");
        Ok(())
    }

    /// Remove a session, disconnecting whatever users it claimed.
    async fn detach(&mut self, id: SessionId) {
        self.sessions.remove(&id);
        let users: Vec<String> = self
            .local
            .iter()
            .filter(|(_, claim)| claim.session == Some(id))
            .map(|(user, _)| user.clone())
            .collect();

        for user in users {
            debug!(session = %id, user = %user, "Disconnecting user of departed session");
            if let Err(e) = self.depart(&user).await {
                warn!(user = %user, error = %e, "Auto-disconnect failed");
            }
        }
        debug!(session = %id, "Session detached");
    }

    async fn depart_all(&mut self) {
        let users: Vec<String> = self.local.keys().cloned().collect();
        info!(users = users.len(), "Releasing local users");
        for user in users {
            if let Err(e) = self.depart(&user).await {
                warn!(user = %user, error = %e, "Departure failed during shutdown");
            }
        }
    }

    fn close_all(&mut self) {
        info!(sessions = self.sessions.len(), "Closing all sessions");
        for (_, session) in self.sessions.drain() {
            deliver(session.sink(), Outbound::Close);
        }
    }
}

/// A running cluster node: coordinator plus bus bridge.
pub struct ClusterNode {
    handle: ClusterHandle,
    coordinator: JoinHandle<()>,
    bridge: JoinHandle<Result<(), BridgeError>>,
    bridge_token: CancellationToken,
    bridge_failure: CancellationToken,
    bus: Arc<dyn Bus>,
}

impl ClusterNode {
    /// Verify the store, subscribe to the bus and start serving.
    ///
    /// # Errors
    ///
    /// Returns the store error if the store is unreachable or the
    /// subscription cannot be established.
    pub async fn start(
        store: Arc<dyn PresenceStore>,
        bus: Arc<dyn Bus>,
        config: ClusterConfig,
    ) -> Result<Self, StoreError> {
        info!("Starting cluster node with config: {:?}", config);
        store.ping().await?;
        // Subscribe before accepting requests so no line published after a
        // request is answered can be missed.
        let subscription = bus.subscribe().await?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = ClusterHandle { tx };
        let bridge_config = config.bridge.clone();
        let coordinator = ClusterCoordinator {
            store,
            bus: Arc::clone(&bus),
            config,
            sessions: HashMap::new(),
            local: BTreeMap::new(),
            node_id: node_id(),
            claims: 0,
            rx,
        };
        let coordinator = tokio::spawn(coordinator.run());

        let bridge_token = CancellationToken::new();
        let bridge_failure = CancellationToken::new();
        let bridge = Bridge::new(Arc::clone(&bus), handle.clone(), bridge_config);
        let bridge = tokio::spawn({
            let token = bridge_token.clone();
            let failure = bridge_failure.clone();
            async move {
                let result = bridge.run(subscription, token).await;
                if result.is_err() {
                    failure.cancel();
                }
                result
            }
        });

        Ok(Self {
            handle,
            coordinator,
            bridge,
            bridge_token,
            bridge_failure,
            bus,
        })
    }

    /// A producer handle for this node.
    #[must_use]
    pub fn handle(&self) -> ClusterHandle {
        self.handle.clone()
    }

    /// Whether the bus bridge has stopped.
    #[must_use]
    pub fn bridge_finished(&self) -> bool {
        self.bridge.is_finished()
    }

    /// A token cancelled if the bridge gives up on the bus.
    #[must_use]
    pub fn bridge_failure(&self) -> CancellationToken {
        self.bridge_failure.clone()
    }

    /// Stop the node: drain the queue and release local users, then end the
    /// bus subscription, then close the bus link.
    ///
    /// # Errors
    ///
    /// Returns the bridge's error if it had already given up on the bus.
    pub async fn shutdown(self) -> Result<(), BridgeError> {
        if let Err(e) = self.handle.shutdown().await {
            debug!(error = %e, "Coordinator already stopped");
        }
        if let Err(e) = self.coordinator.await {
            warn!(error = %e, "Coordinator task failed");
        }

        self.bridge_token.cancel();
        let bridged = match self.bridge.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Bridge task failed");
                Ok(())
            }
        };

        self.bus.close().await;
        info!("Cluster node stopped");
        bridged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{MemoryHub, MemoryLink, ScanPage};
    use crate::session::outbox;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    async fn start(hub: &MemoryHub) -> ClusterNode {
        let link = Arc::new(hub.link());
        ClusterNode::start(link.clone(), link, ClusterConfig::default())
            .await
            .unwrap()
    }

    async fn attach(handle: &ClusterHandle) -> (SessionId, Receiver<Outbound>) {
        let (sink, rx) = outbox(64);
        let id = handle.attach(sink).await.unwrap();
        (id, rx)
    }

    async fn next_line(rx: &mut Receiver<Outbound>) -> String {
        let outbound = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("sink closed");
        match outbound {
            Outbound::Message(msg) => msg.body(),
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn next_bus_line(sub: &mut Box<dyn crate::presence::Subscription>) -> String {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for bus")
            .unwrap()
            .expect("bus closed")
    }

    #[tokio::test]
    async fn test_connect_chat_list_disconnect() {
        let hub = MemoryHub::new();
        let node = start(&hub).await;
        let handle = node.handle();
        let (session, mut rx) = attach(&handle).await;

        handle.connect(Some(session), "alice").await.unwrap();
        assert_eq!(next_line(&mut rx).await, "alice connected.");
        assert!(hub.exists("active.alice"));

        handle.chat("alice", "hello").await.unwrap();
        assert_eq!(next_line(&mut rx).await, "> alice : hello");

        assert_eq!(handle.list_users().await.unwrap(), vec!["alice"]);

        handle.disconnect("alice").await.unwrap();
        assert_eq!(next_line(&mut rx).await, "> alice, left the chat");
        assert!(!hub.exists("active.alice"));
        assert!(handle.list_users().await.unwrap().is_empty());

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_username_unique_across_nodes() {
        let hub = MemoryHub::new();
        let a = start(&hub).await;
        let b = start(&hub).await;

        a.handle().connect(None, "bob").await.unwrap();
        let err = b.handle().connect(None, "bob").await.unwrap_err();
        assert!(matches!(err, CommandError::Duplicate(ref user) if user == "bob"));
        assert_eq!(hub.record_count(), 1);

        a.handle().disconnect("bob").await.unwrap();
        b.handle().connect(None, "bob").await.unwrap();

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lines_reach_sessions_on_every_node() {
        let hub = MemoryHub::new();
        let a = start(&hub).await;
        let b = start(&hub).await;
        let (_, mut on_a) = attach(&a.handle()).await;
        let (_, mut on_b) = attach(&b.handle()).await;

        a.handle().connect(None, "carol").await.unwrap();
        a.handle().chat("carol", "hi all").await.unwrap();

        for rx in [&mut on_a, &mut on_b] {
            assert_eq!(next_line(rx).await, "carol connected.");
            assert_eq!(next_line(rx).await, "> carol : hi all");
        }

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_chat_requires_presence() {
        let hub = MemoryHub::new();
        let node = start(&hub).await;
        let handle = node.handle();

        let err = handle.chat("ghost", "boo").await.unwrap_err();
        assert_eq!(err.to_string(), "ghost is not connected");
        assert!(matches!(
            handle.connect(None, "").await,
            Err(CommandError::UserRequired)
        ));

        // Disconnecting an unknown user is a no-op.
        handle.disconnect("ghost").await.unwrap();
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_users_sorted_and_idempotent() {
        let hub = MemoryHub::new();
        for user in ["zed", "amy", "kim"] {
            hub.claim(&presence_key(user), user);
        }
        hub.claim("other.key", "x");
        let node = start(&hub).await;
        let handle = node.handle();

        let first = handle.list_users().await.unwrap();
        let second = handle.list_users().await.unwrap();
        assert_eq!(first, vec!["amy", "kim", "zed"]);
        assert_eq!(first, second);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_users_pages_through_store() {
        let hub = MemoryHub::new();
        for i in 0..25 {
            let user = format!("user{i:02}");
            hub.claim(&presence_key(&user), &user);
        }
        let link = Arc::new(hub.link());
        let config = ClusterConfig {
            scan_count: 4,
            ..Default::default()
        };
        let node = ClusterNode::start(link.clone(), link, config).await.unwrap();

        let users = node.handle().list_users().await.unwrap();
        assert_eq!(users.len(), 25);
        assert_eq!(users.first().map(String::as_str), Some("user00"));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_disconnects_bound_user() {
        let hub = MemoryHub::new();
        let node = start(&hub).await;
        let handle = node.handle();
        let (session, _rx) = attach(&handle).await;
        let (_, mut watcher) = attach(&handle).await;

        handle.connect(Some(session), "dave").await.unwrap();
        assert_eq!(next_line(&mut watcher).await, "dave connected.");

        handle.detach(session).await.unwrap();
        assert_eq!(next_line(&mut watcher).await, "> dave, left the chat");
        assert!(!hub.exists("active.dave"));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_departures_leave_a_newer_claim_alone() {
        let hub = MemoryHub::new();
        let observer = hub.link();
        let mut bus = observer.subscribe().await.unwrap();
        let a = start(&hub).await;
        let b = start(&hub).await;
        let (session, _rx) = attach(&a.handle()).await;

        a.handle().connect(Some(session), "dave").await.unwrap();
        a.handle().connect(None, "erin").await.unwrap();
        for user in ["dave", "erin"] {
            b.handle().disconnect(user).await.unwrap();
            b.handle().connect(None, user).await.unwrap();
        }
        let dave = hub.owner("active.dave");
        let erin = hub.owner("active.erin");
        assert!(dave.is_some() && erin.is_some());

        a.handle().detach(session).await.unwrap();
        let err = a.handle().connect(None, "dave").await.unwrap_err();
        assert!(matches!(err, CommandError::Duplicate(_)));
        assert_eq!(hub.owner("active.dave"), dave);

        a.shutdown().await.unwrap();
        assert_eq!(hub.owner("active.erin"), erin);

        b.handle().chat("dave", "still here").await.unwrap();
        let expected = [
            "dave connected.",
            "erin connected.",
            "> dave, left the chat",
            "dave connected.",
            "> erin, left the chat",
            "erin connected.",
            "> dave : still here",
        ];
        for line in expected {
            assert_eq!(next_bus_line(&mut bus).await, line);
        }

        b.shutdown().await.unwrap();
        assert_eq!(hub.record_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_departs_then_closes() {
        let hub = MemoryHub::new();
        let observer: MemoryLink = hub.link();
        let mut bus = observer.subscribe().await.unwrap();

        let node = start(&hub).await;
        let handle = node.handle();
        let (session, mut rx) = attach(&handle).await;
        handle.connect(Some(session), "erin").await.unwrap();
        handle.chat("erin", "bye soon").await.unwrap();

        node.shutdown().await.unwrap();

        assert_eq!(next_bus_line(&mut bus).await, "erin connected.");
        assert_eq!(next_bus_line(&mut bus).await, "> erin : bye soon");
        assert_eq!(next_bus_line(&mut bus).await, "> erin, left the chat");
        assert!(!hub.exists("active.erin"));

        // The session was told to close once the queue was drained.
        let mut saw_close = false;
        while let Ok(outbound) = rx.try_recv() {
            saw_close |= outbound == Outbound::Close;
        }
        assert!(saw_close);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.list_users().await,
            Err(CommandError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connect_rolls_back_when_publish_fails() {
        let hub = MemoryHub::new();
        let store = Arc::new(hub.link());
        let bus = Arc::new(hub.link());
        let node = ClusterNode::start(store, bus.clone(), ClusterConfig::default())
            .await
            .unwrap();

        bus.close().await;
        let err = node.handle().connect(None, "frank").await.unwrap_err();
        assert!(matches!(err, CommandError::Store(StoreError::Closed)));
        assert!(!hub.exists("active.frank"));
        node.shutdown().await.unwrap();
    }

    /// Applies every claim but reports a timeout.
    struct LateClaims(MemoryLink);

    #[async_trait]
    impl PresenceStore for LateClaims {
        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }

        async fn claim(&self, key: &str, value: &str) -> Result<bool, StoreError> {
            self.0.claim(key, value).await?;
            Err(StoreError::Timeout)
        }

        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.0.exists(key).await
        }

        async fn owner(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.owner(key).await
        }

        async fn release(&self, key: &str) -> Result<bool, StoreError> {
            self.0.release(key).await
        }

        async fn release_if(&self, key: &str, value: &str) -> Result<bool, StoreError> {
            self.0.release_if(key, value).await
        }

        async fn scan(
            &self,
            prefix: &str,
            after: Option<String>,
            count: usize,
        ) -> Result<ScanPage, StoreError> {
            self.0.scan(prefix, after, count).await
        }
    }

    #[tokio::test]
    async fn test_connect_rolls_back_claim_that_timed_out() {
        let hub = MemoryHub::new();
        let store = Arc::new(LateClaims(hub.link()));
        let bus = Arc::new(hub.link());
        let node = ClusterNode::start(store, bus, ClusterConfig::default())
            .await
            .unwrap();

        let err = node.handle().connect(None, "gina").await.unwrap_err();
        assert!(matches!(err, CommandError::Store(StoreError::Timeout)));
        assert!(!hub.exists("active.gina"));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_on_closed_store() {
        let hub = MemoryHub::new();
        let link = Arc::new(hub.link());
        link.close().await;
        let result = ClusterNode::start(link.clone(), link, ClusterConfig::default()).await;
        assert!(matches!(result, Err(StoreError::Closed)));
    }
}
