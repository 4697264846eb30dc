//! Cluster mode: RPC over WebSocket frames in front of a cluster node.
//!
//! Requests are answered in the order they arrive on a connection. Every bus
//! line the node receives is pushed to every connection as a `Line` frame.

use crate::config::{Config, StoreKind};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::remote::RemoteHub;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{
    outbox, Bus, ClusterHandle, ClusterNode, CommandError, MemoryHub, Outbound, PresenceStore,
    SessionId, ShutdownCoordinator,
};
use huddle_protocol::{codec, codes, Frame};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const LISTENER: &str = "rpc";

/// Shared RPC server state.
struct RpcState {
    node: ClusterHandle,
    outbound_capacity: usize,
    shutdown: ShutdownCoordinator,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

/// Connect to the configured presence store, start a node and serve RPC.
///
/// # Errors
///
/// Returns an error if the store is unreachable, the listener cannot be
/// bound, or the bus bridge fails.
pub async fn run(config: Config, shutdown: ShutdownCoordinator) -> Result<()> {
    let (store, bus): (Arc<dyn PresenceStore>, Arc<dyn Bus>) = match config.cluster.store {
        StoreKind::Memory => {
            info!("Using in-process presence store");
            let link = Arc::new(MemoryHub::new().link());
            (link.clone(), link)
        }
        StoreKind::Hub => {
            let hub = RemoteHub::connect(
                &config.cluster.hub_url,
                config.request_timeout(),
                config.limits.max_frame_size,
            )
            .await
            .with_context(|| format!("Failed to reach hub at {}", config.cluster.hub_url))?;
            let hub = Arc::new(hub);
            (hub.clone(), hub)
        }
    };

    let node = ClusterNode::start(store, bus, config.cluster_config())
        .await
        .context("Presence store is unavailable")?;

    let addr = config.bind_addr(config.cluster.port)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind RPC listener on {addr}"))?;
    serve(listener, node, config, shutdown).await
}

/// Serve RPC on `listener` until shutdown or bridge failure, then stop the node.
///
/// # Errors
///
/// Returns an error if serving fails or the bus bridge gave up.
pub async fn serve(
    listener: TcpListener,
    node: ClusterNode,
    config: Config,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let state = Arc::new(RpcState {
        node: node.handle(),
        outbound_capacity: config.coordinator.outbound_capacity,
        shutdown: shutdown.clone(),
    });

    let app = Router::new()
        .route(&config.cluster.rpc_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = listener.local_addr()?;
    info!("Huddle cluster node listening on {}", addr);
    info!("RPC endpoint: ws://{}{}", addr, config.cluster.rpc_path);

    let token = shutdown.token();
    let bridge_failure = node.bridge_failure();
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let token = token.clone();
            async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = bridge_failure.cancelled() => {
                        error!("Bus bridge failed, shutting down");
                        token.cancel();
                    }
                }
            }
        })
        .await?;

    info!("Stopped accepting RPC connections");

    let bridged = node.shutdown().await;
    shutdown.graceful_shutdown(config.shutdown_timeout()).await;
    bridged.context("Bus bridge failed")?;

    info!("Cluster node stopped");
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RpcState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let tracker = state.shutdown.clone();
        let token = tracker.child_token();
        tracker.spawn(handle_websocket(socket, state, token));
    })
}

/// Handle one RPC connection.
async fn handle_websocket(socket: WebSocket, state: Arc<RpcState>, token: CancellationToken) {
    let _metrics_guard = ConnectionMetricsGuard::new(LISTENER);

    let (sink, outbound) = outbox(state.outbound_capacity);
    let Ok(session) = state.node.attach(sink).await else {
        debug!("Node stopped before attach");
        return;
    };
    debug!(session = %session, "RPC session started");

    let (sender, mut receiver) = socket.split();
    let (responses, responses_rx) = mpsc::channel(32);
    let closed = CancellationToken::new();
    let writer = tokio::spawn(write_frames(sender, responses_rx, outbound, closed.clone()));

    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut shutting_down = false;

    'read: loop {
        let msg = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            () = token.cancelled() => {
                shutting_down = true;
                break;
            }
            msg = receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Binary(data))) => {
                metrics::record_frame(data.len(), "inbound");
                read_buffer.extend_from_slice(&data);
            }
            Some(Ok(Message::Text(text))) => {
                // For compatibility, treat text as binary
                read_buffer.extend_from_slice(text.as_bytes());
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) => {
                debug!(session = %session, "Received close frame");
                break;
            }
            Some(Err(e)) => {
                warn!(session = %session, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
            None => {
                debug!(session = %session, "WebSocket stream ended");
                break;
            }
        }

        loop {
            match codec::decode_from(&mut read_buffer) {
                Ok(Some(frame)) => {
                    let response = dispatch(&state.node, session, frame).await;
                    if responses.send(response).await.is_err() {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session = %session, error = %e, "Undecodable frame");
                    metrics::record_error("decode");
                    let _ = responses
                        .send(Frame::error(0, codes::INVALID, e.to_string()))
                        .await;
                    break 'read;
                }
            }
        }
    }

    drop(responses);
    if !shutting_down {
        // Disconnects any user this connection claimed.
        if state.node.detach(session).await.is_err() {
            debug!(session = %session, "Node stopped before detach");
        }
    }

    if let Err(e) = writer.await {
        warn!(session = %session, error = %e, "Writer task failed");
    }
    debug!(session = %session, "RPC session ended");
}

/// Apply one request frame and build its reply.
async fn dispatch(node: &ClusterHandle, session: SessionId, frame: Frame) -> Frame {
    let start = Instant::now();

    let (operation, response) = match frame {
        Frame::Connect { id, user } => {
            debug!(session = %session, user = %user, "Connect request");
            let result = node.connect(Some(session), user).await;
            ("connect", ack_or_error(id, result))
        }
        Frame::Chat { id, user, text } => {
            let result = node.chat(user, text).await;
            ("chat", ack_or_error(id, result))
        }
        Frame::Disconnect { id, user } => {
            debug!(session = %session, user = %user, "Disconnect request");
            let result = node.disconnect(user).await;
            ("disconnect", ack_or_error(id, result))
        }
        Frame::ListUsers { id } => {
            let response = match node.list_users().await {
                Ok(users) => Frame::Users { id, users },
                Err(e) => error_frame(id, &e),
            };
            ("list_users", response)
        }
        other => {
            warn!(session = %session, frame_type = ?other.frame_type(), "Unexpected frame type");
            let id = other.id().unwrap_or_default();
            let message = format!("unexpected frame {:?}", other.frame_type());
            ("unexpected", Frame::error(id, codes::UNEXPECTED, message))
        }
    };

    metrics::record_rpc(operation, start.elapsed().as_secs_f64());
    response
}

fn ack_or_error(id: u64, result: Result<(), CommandError>) -> Frame {
    match result {
        Ok(()) => Frame::ack(id),
        Err(e) => error_frame(id, &e),
    }
}

fn error_frame(id: u64, error: &CommandError) -> Frame {
    let code = match error {
        CommandError::Duplicate(_) => codes::DUPLICATE,
        CommandError::NotConnected(_) => codes::NOT_CONNECTED,
        CommandError::Store(_) => codes::STORE,
        CommandError::Closed => codes::UNAVAILABLE,
        _ => codes::INVALID,
    };
    Frame::error(id, code, error.to_string())
}

/// Write replies and pushed lines until the session is closed.
async fn write_frames(
    mut sender: SplitSink<WebSocket, Message>,
    mut responses: mpsc::Receiver<Frame>,
    mut outbound: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = responses.recv() => frame,
            item = outbound.recv() => match item {
                Some(Outbound::Message(message)) => Frame::line(message.body()),
                Some(Outbound::Reply(reply)) => Frame::line(reply.to_string()),
                Some(Outbound::Close) | None => break,
            },
        };

        if send_frame(&mut sender, &frame).await.is_err() {
            break;
        }
    }

    closed.cancel();
    if let Err(e) = sender.send(Message::Close(None)).await {
        debug!(error = %e, "Close frame not sent");
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
