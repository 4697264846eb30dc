//! Local mode: rooms on one node, served over the line protocol.
//!
//! Every connection gets a reader that parses lines into commands for the
//! coordinator and a writer task that drains the session's outbound queue.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use huddle_core::{outbox, Coordinator, CoordinatorHandle, Outbound, SessionId, ShutdownCoordinator};
use huddle_protocol::{parse_line, Reply};
use huddle_transport::{LineConnection, LineListener, LineReader, LineWriter, TransportError};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LISTENER: &str = "line";

/// Bind the line listener and serve until shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run(config: Config, shutdown: ShutdownCoordinator) -> Result<()> {
    let addr = config.bind_addr(config.port)?;
    let listener = LineListener::bind(addr, config.limits.max_line_length)
        .await
        .with_context(|| format!("Failed to bind line listener on {addr}"))?;
    serve(listener, config, shutdown).await
}

/// Serve `listener` until the shutdown token is cancelled.
///
/// # Errors
///
/// Returns an error if the listener has no local address.
pub async fn serve(listener: LineListener, config: Config, shutdown: ShutdownCoordinator) -> Result<()> {
    let (coordinator, coordinator_task) = Coordinator::spawn(config.coordinator_config());
    let token = shutdown.token();
    let slots = Arc::new(Semaphore::new(config.limits.max_connections));

    info!("Huddle local server listening on {}", listener.local_addr()?);

    loop {
        let accepted = tokio::select! {
            () = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let connection = match accepted {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                metrics::record_error("accept");
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
            warn!(peer = %connection.remote_addr(), "Connection limit reached");
            metrics::record_rejected(LISTENER);
            continue;
        };

        let handle = coordinator.clone();
        let capacity = config.coordinator.outbound_capacity;
        let conn_token = shutdown.child_token();
        shutdown.spawn(async move {
            let _permit = permit;
            handle_connection(connection, handle, capacity, conn_token).await;
        });
    }

    info!("Stopped accepting line connections");

    // Queued commands are applied before sessions are told to close.
    if let Err(e) = coordinator.shutdown().await {
        warn!(error = %e, "Coordinator already stopped");
    }
    if let Err(e) = coordinator_task.await {
        warn!(error = %e, "Coordinator task failed");
    }
    shutdown.graceful_shutdown(config.shutdown_timeout()).await;

    info!("Local server stopped");
    Ok(())
}

enum ReadEnd {
    /// The peer, the writer or the transport ended the session.
    Finished,
    /// The server is shutting down; the coordinator closes the session.
    Shutdown,
}

async fn handle_connection(
    connection: LineConnection,
    coordinator: CoordinatorHandle,
    outbound_capacity: usize,
    token: CancellationToken,
) {
    let _metrics_guard = ConnectionMetricsGuard::new(LISTENER);
    let id = connection.id();
    let peer = connection.remote_addr();
    let (reader, writer) = connection.split();

    let (sink, rx) = outbox(outbound_capacity);
    let Ok(session) = coordinator.attach(sink).await else {
        debug!(connection = %id, "Coordinator stopped before attach");
        return;
    };
    debug!(connection = %id, session = %session, peer = %peer, "Line session started");

    let closed = CancellationToken::new();
    let writer_task = tokio::spawn(write_outbound(writer, rx, closed.clone()));

    match read_commands(reader, &coordinator, session, &token, &closed).await {
        ReadEnd::Finished => {
            // A no-op if the session already quit.
            if coordinator.detach(session).await.is_err() {
                debug!(session = %session, "Coordinator stopped before detach");
            }
        }
        ReadEnd::Shutdown => {}
    }

    if let Err(e) = writer_task.await {
        warn!(session = %session, error = %e, "Writer task failed");
    }
    debug!(connection = %id, session = %session, "Line session ended");
}

async fn read_commands(
    mut reader: LineReader,
    coordinator: &CoordinatorHandle,
    session: SessionId,
    token: &CancellationToken,
    closed: &CancellationToken,
) -> ReadEnd {
    loop {
        let line = tokio::select! {
            biased;
            () = closed.cancelled() => return ReadEnd::Finished,
            () = token.cancelled() => return ReadEnd::Shutdown,
            line = reader.next_line() => line,
        };

        let submitted = match line {
            Ok(Some(line)) => {
                metrics::record_line("inbound");
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(command) => {
                        metrics::record_command(command.kind());
                        coordinator.submit(session, command).await
                    }
                    Err(e) => {
                        debug!(session = %session, error = %e, "Unparseable line");
                        coordinator.notify(session, Reply::err(e.to_string())).await
                    }
                }
            }
            Ok(None) => return ReadEnd::Finished,
            Err(e @ TransportError::LineTooLong(_)) => {
                metrics::record_error("line_too_long");
                let _ = coordinator.notify(session, Reply::err(e.to_string())).await;
                return ReadEnd::Finished;
            }
            Err(e) => {
                debug!(session = %session, error = %e, "Read failed");
                return ReadEnd::Finished;
            }
        };

        if submitted.is_err() {
            return ReadEnd::Shutdown;
        }
    }
}

fn render(outbound: &Outbound) -> Option<String> {
    match outbound {
        Outbound::Reply(reply) => Some(reply.to_string()),
        Outbound::Message(message) => Some(format!("> {}", message.body())),
        Outbound::Close => None,
    }
}

async fn write_outbound(
    mut writer: LineWriter,
    mut rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
) {
    while let Some(outbound) = rx.recv().await {
        let Some(line) = render(&outbound) else {
            break;
        };
        if let Err(e) = writer.send_line(&line).await {
            debug!(error = %e, "Write failed");
            break;
        }
        metrics::record_line("outbound");
    }

    closed.cancel();
    if let Err(e) = writer.close().await {
        debug!(error = %e, "Close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        addr: SocketAddr,
        shutdown: ShutdownCoordinator,
        server: JoinHandle<Result<()>>,
    }

    async fn start(max_line_length: usize) -> Harness {
        let mut config = Config::default();
        config.limits.max_line_length = max_line_length;
        let listener = LineListener::bind("127.0.0.1:0".parse().unwrap(), max_line_length)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownCoordinator::new();
        let server = tokio::spawn(serve(listener, config, shutdown.clone()));
        Harness {
            addr,
            shutdown,
            server,
        }
    }

    struct Client {
        reader: LineReader,
        writer: LineWriter,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = LineConnection::connect(addr, 1024).await.unwrap().split();
            Self { reader, writer }
        }

        async fn send(&mut self, line: &str) {
            self.writer.send_line(line).await.unwrap();
        }

        async fn expect(&mut self, expected: &str) {
            let line = tokio::time::timeout(Duration::from_secs(1), self.reader.next_line())
                .await
                .expect("timed out")
                .unwrap();
            assert_eq!(line.as_deref(), Some(expected));
        }

        async fn expect_eof(&mut self) {
            let line = tokio::time::timeout(Duration::from_secs(1), self.reader.next_line())
                .await
                .expect("timed out");
            assert!(matches!(line, Ok(None) | Err(_)), "unexpected {line:?}");
        }
    }

    #[tokio::test]
    async fn test_two_clients_chat_in_a_room() {
        let harness = start(1024).await;
        let mut a = Client::connect(harness.addr).await;
        let mut b = Client::connect(harness.addr).await;

        a.send("/name A").await;
        a.expect("> Hello A").await;
        a.send("/join lobby").await;
        a.expect("> you joined lobby").await;

        b.send("/name B").await;
        b.expect("> Hello B").await;
        b.send("/join lobby").await;
        b.expect("> you joined lobby").await;
        a.expect("> B joined the room").await;

        a.send("/msg hi there").await;
        b.expect("> A: hi there").await;

        b.send("/rooms").await;
        b.expect("> rooms: lobby").await;

        b.send("/quit").await;
        b.expect("> you left the room: lobby").await;
        b.expect("> closing connection").await;
        b.expect_eof().await;
        a.expect("> B left").await;

        harness.shutdown.shutdown();
        harness.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_errors_keep_connection_open() {
        let harness = start(1024).await;
        let mut a = Client::connect(harness.addr).await;

        a.send("/dance").await;
        a.expect("err: unknown command: /dance").await;
        a.send("/name").await;
        a.expect("err: <name> is required as a parameter for /name command").await;
        a.send("/msg hello").await;
        a.expect("err: join a room before sending messages").await;
        a.send("/name C\r").await;
        a.expect("> Hello C").await;

        harness.shutdown.shutdown();
        harness.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let harness = start(32).await;
        let mut a = Client::connect(harness.addr).await;

        a.send(&format!("/msg {}", "x".repeat(64))).await;
        a.expect("err: line too long (max 32 bytes)").await;
        a.expect_eof().await;

        harness.shutdown.shutdown();
        harness.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_closes_sessions() {
        let harness = start(1024).await;
        let mut a = Client::connect(harness.addr).await;
        a.send("/name A").await;
        a.expect("> Hello A").await;

        harness.shutdown.shutdown();
        a.expect("> server shutting down").await;
        a.expect_eof().await;
        harness.server.await.unwrap().unwrap();
    }
}
