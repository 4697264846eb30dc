//! Interactive client for a cluster node.
//!
//! Prompts for a username until the node accepts it, then sends every input
//! line as chat and prints every line the node pushes. `/users` lists the
//! connected users. On interruption or end of input the user is
//! disconnected before the connection closes.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use huddle_protocol::Frame;
use huddle_transport::{FrameReceiver, FrameSender, WebSocketConnection};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PROMPT: &str = "> Enter a username";

/// How long to wait for the node to confirm a disconnect.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connect to `url` and chat on stdin and stdout until interrupted.
///
/// # Errors
///
/// Returns an error if the node cannot be reached or the connection fails.
pub async fn run(
    url: &str,
    user: Option<String>,
    max_frame_size: usize,
    token: CancellationToken,
) -> Result<()> {
    let connection = WebSocketConnection::connect(url, max_frame_size)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    let client = ChatClient::new(connection, tokio::io::stdin(), tokio::io::stdout());
    client.run(user, token).await
}

/// A chat session over one RPC connection.
pub struct ChatClient<R, W> {
    sender: FrameSender,
    receiver: FrameReceiver,
    input: FramedRead<R, LinesCodec>,
    output: W,
    next_id: u64,
}

impl<R, W> ChatClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap `connection`, reading chat from `input` and printing to `output`.
    pub fn new(connection: WebSocketConnection, input: R, output: W) -> Self {
        let (sender, receiver) = connection.split();
        Self {
            sender,
            receiver,
            input: FramedRead::new(input, LinesCodec::new()),
            output,
            next_id: 1,
        }
    }

    /// Register, then chat until `token` is cancelled, input ends, or the
    /// node closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the output fails.
    pub async fn run(mut self, user: Option<String>, token: CancellationToken) -> Result<()> {
        let Some(user) = self.register(user, &token).await? else {
            self.sender.close().await?;
            return Ok(());
        };
        debug!(user = %user, "Registered");

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                frame = self.receiver.recv() => match frame? {
                    Some(frame) => self.show(frame).await?,
                    None => {
                        self.print("> connection closed by server").await?;
                        return Ok(());
                    }
                },
                line = self.input.next() => match line {
                    Some(line) => {
                        let line = line?;
                        self.send_input(&user, line.trim()).await?;
                    }
                    None => break,
                },
            }
        }

        self.leave(&user).await
    }

    /// Prompt until the node accepts a username. `None` if input ended first.
    async fn register(
        &mut self,
        mut user: Option<String>,
        token: &CancellationToken,
    ) -> Result<Option<String>> {
        loop {
            let candidate = match user.take() {
                Some(candidate) => candidate,
                None => {
                    self.print(PROMPT).await?;
                    let line = tokio::select! {
                        () = token.cancelled() => return Ok(None),
                        line = self.input.next() => line,
                    };
                    match line {
                        Some(line) => line?.trim().to_string(),
                        None => return Ok(None),
                    }
                }
            };
            if candidate.is_empty() {
                continue;
            }

            let id = self.next_id();
            self.sender
                .send(&Frame::Connect {
                    id,
                    user: candidate.clone(),
                })
                .await?;

            match self.reply(id).await? {
                Frame::Ack { .. } => return Ok(Some(candidate)),
                Frame::Error { message, .. } => self.print(&format!("err: {message}")).await?,
                other => bail!("unexpected reply {:?}", other.frame_type()),
            }
        }
    }

    async fn send_input(&mut self, user: &str, line: &str) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let id = self.next_id();
        let frame = if line == "/users" {
            Frame::ListUsers { id }
        } else {
            Frame::Chat {
                id,
                user: user.to_string(),
                text: line.to_string(),
            }
        };
        self.sender.send(&frame).await?;
        Ok(())
    }

    /// Disconnect `user` and close the connection.
    async fn leave(mut self, user: &str) -> Result<()> {
        let id = self.next_id();
        self.sender
            .send(&Frame::Disconnect {
                id,
                user: user.to_string(),
            })
            .await?;

        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.reply(id)).await {
            Ok(Ok(_)) => debug!(user = %user, "Disconnected"),
            Ok(Err(e)) => warn!(user = %user, error = %e, "Disconnect failed"),
            Err(_) => warn!(user = %user, "Disconnect not confirmed"),
        }

        self.sender.close().await?;
        Ok(())
    }

    /// Wait for the reply to request `id`, showing anything pushed meanwhile.
    async fn reply(&mut self, id: u64) -> Result<Frame> {
        loop {
            match self.receiver.recv().await? {
                Some(frame) if frame.id() == Some(id) => return Ok(frame),
                Some(frame) => self.show(frame).await?,
                None => bail!("connection closed by server"),
            }
        }
    }

    async fn show(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Line { text } => self.print(&text).await,
            Frame::Users { users, .. } => self.print(&format!("> users: {}", users.join(", "))).await,
            Frame::Error { message, .. } => self.print(&format!("err: {message}")).await,
            _ => Ok(()),
        }
    }

    async fn print(&mut self, line: &str) -> Result<()> {
        self.output.write_all(line.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await?;
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rpc;
    use huddle_core::{Bus, ClusterConfig, ClusterNode, MemoryHub, ShutdownCoordinator};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn start(hub: &MemoryHub) -> (SocketAddr, ShutdownCoordinator, tokio::task::JoinHandle<Result<()>>) {
        let link = Arc::new(hub.link());
        let node = ClusterNode::start(link.clone(), link, ClusterConfig::default())
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownCoordinator::new();
        let server = tokio::spawn(rpc::serve(listener, node, Config::default(), shutdown.clone()));
        (addr, shutdown, server)
    }

    #[tokio::test]
    async fn test_reprompts_on_duplicate_and_disconnects_on_eof() {
        let hub = MemoryHub::new();
        assert!(hub.claim("active.bob", "elsewhere"));
        let (addr, shutdown, server) = start(&hub).await;

        let connection = WebSocketConnection::connect(&format!("ws://{addr}/rpc"), 64 * 1024)
            .await
            .unwrap();
        let mut output = Vec::new();
        let input: &[u8] = b"bob\n\ncarol\nhello\n";
        ChatClient::new(connection, input, &mut output)
            .run(None, CancellationToken::new())
            .await
            .unwrap();

        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            &lines[..4],
            &[
                PROMPT,
                "err: user already exists and is connected. choose another username",
                PROMPT,
                PROMPT,
            ]
        );
        assert!(hub.exists("active.bob"));
        assert!(!hub.exists("active.carol"));

        shutdown.shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_given_username_skips_prompt() {
        let hub = MemoryHub::new();
        let (addr, shutdown, server) = start(&hub).await;
        let observer = hub.link();
        let mut bus = observer.subscribe().await.unwrap();

        let connection = WebSocketConnection::connect(&format!("ws://{addr}/rpc"), 64 * 1024)
            .await
            .unwrap();
        let mut output = Vec::new();
        let input: &[u8] = b"";
        ChatClient::new(connection, input, &mut output)
            .run(Some("dora".into()), CancellationToken::new())
            .await
            .unwrap();

        assert!(!String::from_utf8(output).unwrap().contains(PROMPT));
        assert_eq!(bus.recv().await.unwrap().as_deref(), Some("dora connected."));
        assert_eq!(
            bus.recv().await.unwrap().as_deref(),
            Some("> dora, left the chat")
        );
        assert!(!hub.exists("active.dora"));

        shutdown.shutdown();
        server.await.unwrap().unwrap();
    }
}
