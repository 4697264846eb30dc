//! Hub mode: the shared presence store and bus for cluster nodes.
//!
//! Nodes reach the hub with [`crate::remote::RemoteHub`]. Each request frame
//! is answered on the connection it arrived on; after `Subscribe`, every
//! published line is pushed to that connection as a `Line` frame.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
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
use huddle_core::{MemoryHub, ShutdownCoordinator};
use huddle_protocol::{codec, codes, Frame};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LISTENER: &str = "hub";

/// Outbound frames a connection may buffer.
const OUTBOUND_BUFFER: usize = 256;

struct HubState {
    hub: MemoryHub,
    shutdown: ShutdownCoordinator,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    records: usize,
}

/// Bind the hub listener and serve until shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run(config: Config, shutdown: ShutdownCoordinator) -> Result<()> {
    let addr = config.bind_addr(config.hub.port)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind hub listener on {addr}"))?;
    serve(listener, MemoryHub::new(), config, shutdown).await
}

/// Serve `hub` on `listener` until the shutdown token is cancelled.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(
    listener: TcpListener,
    hub: MemoryHub,
    config: Config,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let state = Arc::new(HubState {
        hub,
        shutdown: shutdown.clone(),
    });

    let app = Router::new()
        .route(&config.hub.path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = listener.local_addr()?;
    info!("Huddle hub listening on {}", addr);
    info!("Hub endpoint: ws://{}{}", addr, config.hub.path);

    let token = shutdown.token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    shutdown.graceful_shutdown(config.shutdown_timeout()).await;
    info!("Hub stopped");
    Ok(())
}

async fn health_handler(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    axum::Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        records: state.hub.record_count(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let tracker = state.shutdown.clone();
        let token = tracker.child_token();
        tracker.spawn(handle_websocket(socket, state, token));
    })
}

/// Handle one node's connection.
async fn handle_websocket(socket: WebSocket, state: Arc<HubState>, token: CancellationToken) {
    let _metrics_guard = ConnectionMetricsGuard::new(LISTENER);
    debug!("Hub connection opened");

    let (sender, mut receiver) = socket.split();
    let (out, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let done = token.child_token();
    let writer = tokio::spawn(write_frames(sender, out_rx, done.clone()));

    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut subscribed = false;

    'read: loop {
        let msg = tokio::select! {
            biased;
            () = done.cancelled() => break,
            msg = receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Binary(data))) => {
                metrics::record_frame(data.len(), "inbound");
                read_buffer.extend_from_slice(&data);
            }
            Some(Ok(Message::Text(text))) => read_buffer.extend_from_slice(text.as_bytes()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }

        loop {
            let frame = match codec::decode_from(&mut read_buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Undecodable frame");
                    metrics::record_error("decode");
                    let _ = out.send(Frame::error(0, codes::INVALID, e.to_string())).await;
                    break 'read;
                }
            };

            let response = match frame {
                Frame::Subscribe { id } => {
                    if !subscribed {
                        subscribed = true;
                        // The receiver exists before the ack is queued.
                        tokio::spawn(forward_lines(
                            state.hub.subscribe_lines(),
                            out.clone(),
                            done.clone(),
                        ));
                        debug!("Hub connection subscribed");
                    }
                    Frame::ack(id)
                }
                request => apply(&state.hub, request),
            };

            if out.send(response).await.is_err() {
                break 'read;
            }
        }
    }

    done.cancel();
    drop(out);
    if let Err(e) = writer.await {
        warn!(error = %e, "Writer task failed");
    }
    debug!("Hub connection closed");
}

/// Answer a store or bus request.
pub(crate) fn apply(hub: &MemoryHub, frame: Frame) -> Frame {
    match frame {
        Frame::Claim { id, key, value } => Frame::Flag {
            id,
            value: hub.claim(&key, &value),
        },
        Frame::Exists { id, key } => Frame::Flag {
            id,
            value: hub.exists(&key),
        },
        Frame::Owner { id, key } => Frame::Value {
            id,
            value: hub.owner(&key),
        },
        Frame::Release { id, key } => Frame::Flag {
            id,
            value: hub.release(&key),
        },
        Frame::ReleaseIf { id, key, value } => Frame::Flag {
            id,
            value: hub.release_if(&key, &value),
        },
        Frame::Scan {
            id,
            prefix,
            after,
            count,
        } => {
            let page = hub.scan(&prefix, after.as_deref(), count as usize);
            Frame::Page {
                id,
                keys: page.keys,
                next: page.next,
            }
        }
        Frame::Publish { id, line } => {
            let receivers = hub.publish(&line);
            debug!(receivers, "Line published");
            Frame::ack(id)
        }
        other => {
            warn!(frame_type = ?other.frame_type(), "Unexpected frame type");
            let id = other.id().unwrap_or_default();
            let message = format!("unexpected frame {:?}", other.frame_type());
            Frame::error(id, codes::UNEXPECTED, message)
        }
    }
}

/// Push every bus line to one subscribed connection.
async fn forward_lines(
    mut lines: tokio::sync::broadcast::Receiver<Arc<str>>,
    out: mpsc::Sender<Frame>,
    done: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = done.cancelled() => break,
            received = lines.recv() => received,
        };

        match received {
            Ok(line) => {
                if out.send(Frame::line(line.as_ref())).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Hub subscriber lagged");
                metrics::record_error("lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn write_frames(
    mut sender: SplitSink<WebSocket, Message>,
    mut out: mpsc::Receiver<Frame>,
    done: CancellationToken,
) {
    while let Some(frame) = out.recv().await {
        let data = match codec::encode(&frame) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                continue;
            }
        };
        metrics::record_frame(data.len(), "outbound");
        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
            break;
        }
    }

    done.cancel();
    if let Err(e) = sender.send(Message::Close(None)).await {
        debug!(error = %e, "Close frame not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_transport::WebSocketConnection;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    async fn start(hub: MemoryHub) -> (SocketAddr, ShutdownCoordinator, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownCoordinator::new();
        let server = tokio::spawn(serve(listener, hub, Config::default(), shutdown.clone()));
        (addr, shutdown, server)
    }

    #[tokio::test]
    async fn test_hub_answers_requests_in_order() {
        let hub = MemoryHub::new();
        let (addr, shutdown, server) = start(hub.clone()).await;
        let url = format!("ws://{addr}/hub");
        let (mut tx, mut rx) = WebSocketConnection::connect(&url, 64 * 1024)
            .await
            .unwrap()
            .split();

        let requests = [
            Frame::Claim {
                id: 1,
                key: "active.amy".into(),
                value: "1".into(),
            },
            Frame::Claim {
                id: 2,
                key: "active.amy".into(),
                value: "1".into(),
            },
            Frame::Exists {
                id: 3,
                key: "active.amy".into(),
            },
            Frame::Scan {
                id: 4,
                prefix: "active.".into(),
                after: None,
                count: 10,
            },
            Frame::ListUsers { id: 5 },
        ];
        for request in &requests {
            tx.send(request).await.unwrap();
        }

        let mut replies = Vec::new();
        for _ in 0..requests.len() {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            replies.push(frame);
        }

        assert_eq!(replies[0], Frame::Flag { id: 1, value: true });
        assert_eq!(replies[1], Frame::Flag { id: 2, value: false });
        assert_eq!(replies[2], Frame::Flag { id: 3, value: true });
        assert_eq!(
            replies[3],
            Frame::Page {
                id: 4,
                keys: vec!["active.amy".into()],
                next: None,
            }
        );
        assert!(matches!(
            replies[4],
            Frame::Error { id: 5, code: codes::UNEXPECTED, .. }
        ));
        assert!(hub.exists("active.amy"));

        shutdown.shutdown();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn test_release_if_needs_matching_value() {
        let hub = MemoryHub::new();
        assert!(hub.claim("active.amy", "n1/1/1"));

        let owner = apply(
            &hub,
            Frame::Owner {
                id: 1,
                key: "active.amy".into(),
            },
        );
        assert_eq!(
            owner,
            Frame::Value {
                id: 1,
                value: Some("n1/1/1".into()),
            }
        );

        let stale = apply(
            &hub,
            Frame::ReleaseIf {
                id: 2,
                key: "active.amy".into(),
                value: "n2/1/1".into(),
            },
        );
        assert_eq!(stale, Frame::Flag { id: 2, value: false });
        assert!(hub.exists("active.amy"));

        let owned = apply(
            &hub,
            Frame::ReleaseIf {
                id: 3,
                key: "active.amy".into(),
                value: "n1/1/1".into(),
            },
        );
        assert_eq!(owned, Frame::Flag { id: 3, value: true });
        assert_eq!(
            apply(
                &hub,
                Frame::Owner {
                    id: 4,
                    key: "active.amy".into(),
                },
            ),
            Frame::Value { id: 4, value: None }
        );
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_lines() {
        let hub = MemoryHub::new();
        let (addr, shutdown, server) = start(hub.clone()).await;
        let url = format!("ws://{addr}/hub");
        let (mut tx, mut rx) = WebSocketConnection::connect(&url, 64 * 1024)
            .await
            .unwrap()
            .split();

        tx.send(&Frame::Subscribe { id: 1 }).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(Frame::ack(1)));

        hub.publish("> amy : hello");
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Some(Frame::line("> amy : hello")));

        shutdown.shutdown();
        server.await.unwrap().unwrap();
        let end = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(end, Ok(None) | Err(_)));
    }
}
