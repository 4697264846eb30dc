//! Newline-delimited text transport over TCP.
//!
//! Each connection is split into a [`LineReader`] and a [`LineWriter`] so a
//! session can read commands and write output from separate tasks.

use crate::error::{ConnectionId, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info};

/// Default maximum line length in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

/// Accepts line connections.
pub struct LineListener {
    listener: TcpListener,
    max_line_length: usize,
}

impl LineListener {
    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, max_line_length: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Line transport listening on {}", addr);
        Ok(Self {
            listener,
            max_line_length,
        })
    }

    /// Get the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next connection.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn accept(&self) -> Result<LineConnection, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);
        LineConnection::new(stream, self.max_line_length)
    }
}

/// A line connection.
pub struct LineConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    stream: TcpStream,
    max_line_length: usize,
}

impl LineConnection {
    /// Wrap an accepted stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address is unavailable.
    pub fn new(stream: TcpStream, max_line_length: usize) -> Result<Self, TransportError> {
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            id: ConnectionId::generate(),
            remote_addr,
            stream,
            max_line_length,
        })
    }

    /// Open a connection to a line server.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        max_line_length: usize,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, max_line_length)
    }

    /// The connection's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer's address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Split into independently owned halves.
    #[must_use]
    pub fn split(self) -> (LineReader, LineWriter) {
        let (read, write) = self.stream.into_split();
        let reader = LineReader {
            id: self.id,
            inner: FramedRead::new(read, LinesCodec::new_with_max_length(self.max_line_length)),
            max_line_length: self.max_line_length,
        };
        let writer = LineWriter {
            id: self.id,
            inner: FramedWrite::new(write, LinesCodec::new()),
        };
        (reader, writer)
    }
}

/// Reading half of a line connection.
pub struct LineReader {
    id: ConnectionId,
    inner: FramedRead<OwnedReadHalf, LinesCodec>,
    max_line_length: usize,
}

impl LineReader {
    /// Receive the next line, without its terminator.
    ///
    /// Returns `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::LineTooLong`] for an oversized line, or the
    /// underlying I/O error.
    pub async fn next_line(&mut self) -> Result<Option<String>, TransportError> {
        match self.inner.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                debug!(connection = %self.id, "Line too long");
                Err(TransportError::LineTooLong(self.max_line_length))
            }
            Some(Err(LinesCodecError::Io(e))) => Err(TransportError::Io(e)),
            None => Ok(None),
        }
    }
}

/// Writing half of a line connection.
pub struct LineWriter {
    id: ConnectionId,
    inner: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl LineWriter {
    /// Write one line; the terminator is appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.inner.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => TransportError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => {
                TransportError::SendFailed(format!("{}: line too long", self.id))
            }
        })
    }

    /// Flush and shut down the write direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or shutdown fails.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::<&str>::close(&mut self.inner)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
