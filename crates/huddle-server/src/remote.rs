//! Presence store and bus backed by a hub over WebSocket.
//!
//! One connection carries every request from a node. Replies are matched
//! to requests by id; `Line` frames are fanned out to local subscriptions.

use async_trait::async_trait;
use dashmap::DashMap;
use huddle_core::{Bus, PresenceStore, ScanPage, StoreError, Subscription};
use huddle_protocol::Frame;
use huddle_transport::{FrameReceiver, FrameSender, WebSocketConnection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requests a node may queue before callers wait.
const REQUEST_BUFFER: usize = 256;

/// Lines a subscription may buffer before it lags.
const LINE_BUFFER: usize = 1024;

type Pending = Arc<DashMap<u64, oneshot::Sender<Frame>>>;

fn connection_lost() -> StoreError {
    StoreError::Unavailable("hub connection lost".into())
}

fn unexpected(frame: &Frame) -> StoreError {
    StoreError::Backend(format!("unexpected reply {:?}", frame.frame_type()))
}

/// A node's connection to the hub.
pub struct RemoteHub {
    outbound: mpsc::Sender<Frame>,
    pending: Pending,
    lines: broadcast::Sender<Arc<str>>,
    next_id: AtomicU64,
    timeout: Duration,
    /// Cancelled by [`Bus::close`].
    closed: CancellationToken,
    /// Cancelled when the connection drops without `close`.
    lost: CancellationToken,
}

impl RemoteHub {
    /// Connect to the hub at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the handshake fails.
    pub async fn connect(
        url: &str,
        timeout: Duration,
        max_frame_size: usize,
    ) -> Result<Self, StoreError> {
        let connection = WebSocketConnection::connect(url, max_frame_size)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!(url = %url, connection = %connection.id(), "Connected to hub");
        let (sender, receiver) = connection.split();

        let (outbound, outbound_rx) = mpsc::channel(REQUEST_BUFFER);
        let (lines, _) = broadcast::channel(LINE_BUFFER);
        let pending: Pending = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        let lost = CancellationToken::new();

        tokio::spawn(write_requests(
            sender,
            outbound_rx,
            closed.clone(),
            lost.clone(),
        ));
        tokio::spawn(read_replies(
            receiver,
            Arc::clone(&pending),
            lines.clone(),
            closed.clone(),
            lost.clone(),
        ));

        Ok(Self {
            outbound,
            pending,
            lines,
            next_id: AtomicU64::new(1),
            timeout,
            closed,
            lost,
        })
    }

    /// Send a request and wait for the frame that answers it.
    async fn request(&self, build: impl FnOnce(u64) -> Frame) -> Result<Frame, StoreError> {
        if self.closed.is_cancelled() {
            return Err(StoreError::Closed);
        }
        if self.lost.is_cancelled() {
            return Err(connection_lost());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.outbound.send(build(id)).await.is_err() {
            self.pending.remove(&id);
            return Err(connection_lost());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Frame::Error { message, .. })) => Err(StoreError::Backend(message)),
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(connection_lost()),
            Err(_) => {
                self.pending.remove(&id);
                warn!(id, "Hub request timed out");
                Err(StoreError::Timeout)
            }
        }
    }

    async fn flag(&self, build: impl FnOnce(u64) -> Frame) -> Result<bool, StoreError> {
        match self.request(build).await? {
            Frame::Flag { value, .. } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }
}

impl Drop for RemoteHub {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl PresenceStore for RemoteHub {
    async fn ping(&self) -> Result<(), StoreError> {
        self.flag(|id| Frame::Exists {
            id,
            key: String::new(),
        })
        .await
        .map(|_| ())
    }

    async fn claim(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.flag(|id| Frame::Claim {
            id,
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.flag(|id| Frame::Exists {
            id,
            key: key.to_string(),
        })
        .await
    }

    async fn owner(&self, key: &str) -> Result<Option<String>, StoreError> {
        let reply = self
            .request(|id| Frame::Owner {
                id,
                key: key.to_string(),
            })
            .await?;
        match reply {
            Frame::Value { value, .. } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn release(&self, key: &str) -> Result<bool, StoreError> {
        self.flag(|id| Frame::Release {
            id,
            key: key.to_string(),
        })
        .await
    }

    async fn release_if(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.flag(|id| Frame::ReleaseIf {
            id,
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<String>,
        count: usize,
    ) -> Result<ScanPage, StoreError> {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        let reply = self
            .request(|id| Frame::Scan {
                id,
                prefix: prefix.to_string(),
                after,
                count,
            })
            .await?;
        match reply {
            Frame::Page { keys, next, .. } => Ok(ScanPage { keys, next }),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl Bus for RemoteHub {
    /// The hub does not report receiver counts, so this returns 0.
    async fn publish(&self, line: &str) -> Result<usize, StoreError> {
        match self
            .request(|id| Frame::Publish {
                id,
                line: line.to_string(),
            })
            .await?
        {
            Frame::Ack { .. } => Ok(0),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, StoreError> {
        // Receive from the moment the hub acknowledges, not after.
        let rx = self.lines.subscribe();
        match self.request(|id| Frame::Subscribe { id }).await? {
            Frame::Ack { .. } => Ok(Box::new(RemoteSubscription {
                rx,
                closed: self.closed.clone(),
                lost: self.lost.clone(),
            })),
            other => Err(unexpected(&other)),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        debug!("Hub connection closed");
    }
}

struct RemoteSubscription {
    rx: broadcast::Receiver<Arc<str>>,
    closed: CancellationToken,
    lost: CancellationToken,
}

#[async_trait]
impl Subscription for RemoteSubscription {
    async fn recv(&mut self) -> Result<Option<String>, StoreError> {
        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => return Ok(None),
                received = self.rx.recv() => match received {
                    Ok(line) => return Ok(Some(line.to_string())),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Hub subscription lagged");
                    }
                    Err(RecvError::Closed) => return Err(connection_lost()),
                },
                () = self.lost.cancelled() => return Err(connection_lost()),
            }
        }
    }
}

async fn write_requests(
    mut sender: FrameSender,
    mut outbound: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    lost: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            () = lost.cancelled() => return,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = sender.send(&frame).await {
            warn!(error = %e, "Failed to send hub request");
            lost.cancel();
            return;
        }
    }

    if let Err(e) = sender.close().await {
        debug!(error = %e, "Hub close frame not sent");
    }
}

async fn read_replies(
    mut receiver: FrameReceiver,
    pending: Pending,
    lines: broadcast::Sender<Arc<str>>,
    closed: CancellationToken,
    lost: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = closed.cancelled() => return,
            received = receiver.recv() => received,
        };

        match received {
            Ok(Some(Frame::Line { text })) => {
                // No subscribers is fine.
                let _ = lines.send(Arc::from(text));
            }
            Ok(Some(frame)) => {
                let Some(id) = frame.id() else { continue };
                match pending.remove(&id) {
                    Some((_, responder)) => {
                        let _ = responder.send(frame);
                    }
                    None => debug!(id, "Reply for an abandoned request"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Hub connection failed");
                break;
            }
        }
    }

    if !closed.is_cancelled() {
        warn!("Hub connection lost");
        lost.cancel();
    }
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hub;
    use huddle_core::presence::scan_all;
    use huddle_core::{ClusterConfig, ClusterNode, CommandError, MemoryHub, ShutdownCoordinator};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(1);

    async fn start_hub() -> (String, ShutdownCoordinator, JoinHandle<anyhow::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let shutdown = ShutdownCoordinator::new();
        let server = tokio::spawn(hub::serve(
            listener,
            MemoryHub::new(),
            Config::default(),
            shutdown.clone(),
        ));
        (format!("ws://{addr}/hub"), shutdown, server)
    }

    async fn link(url: &str) -> RemoteHub {
        RemoteHub::connect(url, TIMEOUT, 64 * 1024).await.unwrap()
    }

    #[tokio::test]
    async fn test_claim_is_unique_across_connections() {
        let (url, shutdown, server) = start_hub().await;
        let a = link(&url).await;
        let b = link(&url).await;

        a.ping().await.unwrap();
        assert!(a.claim("active.bob", "1").await.unwrap());
        assert!(!b.claim("active.bob", "1").await.unwrap());
        assert!(b.exists("active.bob").await.unwrap());
        assert!(b.release("active.bob").await.unwrap());
        assert!(!a.exists("active.bob").await.unwrap());
        assert!(!a.release("active.bob").await.unwrap());

        assert!(a.claim("active.bob", "n1/1/1").await.unwrap());
        assert_eq!(b.owner("active.bob").await.unwrap().as_deref(), Some("n1/1/1"));
        assert!(!b.release_if("active.bob", "n2/1/1").await.unwrap());
        assert!(b.release_if("active.bob", "n1/1/1").await.unwrap());
        assert_eq!(a.owner("active.bob").await.unwrap(), None);

        shutdown.shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_scan_pages_through_hub() {
        let (url, shutdown, server) = start_hub().await;
        let remote = link(&url).await;
        for user in ["eve", "bob", "dan", "amy", "cal"] {
            remote.claim(&format!("active.{user}"), "1").await.unwrap();
        }
        remote.claim("other.zed", "1").await.unwrap();

        let page = remote.scan("active.", None, 2).await.unwrap();
        assert_eq!(page.keys, vec!["active.amy", "active.bob"]);
        assert_eq!(page.next.as_deref(), Some("active.bob"));

        let keys = scan_all(&remote, "active.", 2).await.unwrap();
        assert_eq!(
            keys,
            vec!["active.amy", "active.bob", "active.cal", "active.dan", "active.eve"]
        );

        shutdown.shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_published_lines_reach_every_subscriber() {
        let (url, shutdown, server) = start_hub().await;
        let a = link(&url).await;
        let b = link(&url).await;
        let mut sub_a = a.subscribe().await.unwrap();
        let mut sub_b = b.subscribe().await.unwrap();

        a.publish("amy connected.").await.unwrap();
        for sub in [&mut sub_a, &mut sub_b] {
            let line = tokio::time::timeout(TIMEOUT, sub.recv()).await.unwrap();
            assert_eq!(line.unwrap().as_deref(), Some("amy connected."));
        }

        a.close().await;
        assert_eq!(sub_a.recv().await.unwrap(), None);
        assert_eq!(a.claim("active.amy", "1").await, Err(StoreError::Closed));

        shutdown.shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lost_hub_fails_subscription() {
        let (url, shutdown, server) = start_hub().await;
        let remote = link(&url).await;
        let mut subscription = remote.subscribe().await.unwrap();

        shutdown.shutdown();
        server.await.unwrap().unwrap();

        let received = tokio::time::timeout(TIMEOUT, subscription.recv()).await.unwrap();
        assert!(matches!(received, Err(StoreError::Unavailable(_))));
        assert!(matches!(
            remote.exists("active.bob").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_nodes_share_presence_through_hub() {
        let (url, shutdown, server) = start_hub().await;
        let mut nodes = Vec::new();
        for _ in 0..2 {
            let remote = Arc::new(link(&url).await);
            let node = ClusterNode::start(remote.clone(), remote, ClusterConfig::default())
                .await
                .unwrap();
            nodes.push(node);
        }

        let a = nodes[0].handle();
        let b = nodes[1].handle();
        a.connect(None, "bob").await.unwrap();
        assert!(matches!(
            b.connect(None, "bob").await,
            Err(CommandError::Duplicate(_))
        ));
        b.connect(None, "amy").await.unwrap();
        assert_eq!(a.list_users().await.unwrap(), vec!["amy", "bob"]);

        for node in nodes {
            node.shutdown().await.unwrap();
        }
        shutdown.shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out_against_silent_hub() {
        use axum::extract::ws::WebSocketUpgrade;
        use axum::routing::get;
        use futures_util::StreamExt;

        async fn silent(ws: WebSocketUpgrade) -> impl axum::response::IntoResponse {
            ws.on_upgrade(|mut socket| async move { while socket.next().await.is_some() {} })
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/hub", get(silent));
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let remote = RemoteHub::connect(&format!("ws://{addr}/hub"), Duration::from_millis(100), 1024)
            .await
            .unwrap();
        assert_eq!(remote.claim("active.bob", "1").await, Err(StoreError::Timeout));

        server.abort();
    }

    #[tokio::test]
    async fn test_claim_answered_late_is_rolled_back() {
        use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
        use axum::extract::State;
        use axum::routing::get;
        use bytes::BytesMut;
        use futures_util::{SinkExt, StreamExt};
        use huddle_protocol::codec;
        use tokio::sync::Mutex;

        const LATE: Duration = Duration::from_millis(300);

        // Applies every request at once but holds claim replies back.
        async fn serve_late(socket: WebSocket, store: MemoryHub) {
            let (sink, mut stream) = socket.split();
            let sink = Arc::new(Mutex::new(sink));
            let mut buffer = BytesMut::new();
            while let Some(Ok(msg)) = stream.next().await {
                let Message::Binary(data) = msg else { continue };
                buffer.extend_from_slice(&data);
                while let Ok(Some(frame)) = codec::decode_from(&mut buffer) {
                    let late = matches!(frame, Frame::Claim { .. });
                    let reply = match frame {
                        Frame::Subscribe { id } => Frame::ack(id),
                        other => hub::apply(&store, other),
                    };
                    let sink = Arc::clone(&sink);
                    let send = async move {
                        if late {
                            tokio::time::sleep(LATE).await;
                        }
                        let data = codec::encode(&reply).unwrap();
                        let _ = sink.lock().await.send(Message::Binary(data.to_vec())).await;
                    };
                    if late {
                        tokio::spawn(send);
                    } else {
                        send.await;
                    }
                }
            }
        }

        async fn late(
            ws: WebSocketUpgrade,
            State(store): State<MemoryHub>,
        ) -> impl axum::response::IntoResponse {
            ws.on_upgrade(move |socket| serve_late(socket, store))
        }

        let store = MemoryHub::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route("/hub", get(late))
            .with_state(store.clone());
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let remote = Arc::new(
            RemoteHub::connect(&format!("ws://{addr}/hub"), Duration::from_millis(100), 64 * 1024)
                .await
                .unwrap(),
        );
        let node = ClusterNode::start(remote.clone(), remote, ClusterConfig::default())
            .await
            .unwrap();

        let err = node.handle().connect(None, "bob").await.unwrap_err();
        assert!(matches!(err, CommandError::Store(StoreError::Timeout)));
        assert!(!store.exists("active.bob"));

        // The late reply finds no waiting request.
        tokio::time::sleep(LATE).await;
        assert!(!store.exists("active.bob"));

        node.shutdown().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_to_missing_hub_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RemoteHub::connect(&format!("ws://{addr}/hub"), TIMEOUT, 1024).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
