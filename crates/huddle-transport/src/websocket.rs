//! WebSocket frame transport (client side) using tokio-tungstenite.
//!
//! Each binary WebSocket message carries one or more length-prefixed
//! MessagePack frames. Frames may also be split across messages, so the
//! receiver keeps a read buffer between messages.

use crate::error::{ConnectionId, TransportError};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, Frame, ProtocolError};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

/// Default maximum WebSocket message size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A client WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    stream: ClientStream,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Connect to `url` (`ws://host:port/path`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] if the connection or upgrade fails.
    pub async fn connect(url: &str, max_message_size: usize) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(url).await.map_err(|e| {
            error!("WebSocket handshake with {} failed: {}", url, e);
            TransportError::Handshake(e.to_string())
        })?;

        let id = ConnectionId::generate();
        debug!(connection = %id, "WebSocket connected to {}", url);

        Ok(Self {
            id,
            stream,
            max_message_size,
        })
    }

    /// The connection's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Split into a sender and a receiver that can live in separate tasks.
    #[must_use]
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        let (sink, stream) = self.stream.split();
        (
            FrameSender { id: self.id, sink },
            FrameReceiver {
                id: self.id,
                stream,
                read_buffer: BytesMut::with_capacity(4096),
                max_message_size: self.max_message_size,
            },
        )
    }
}

/// Sending half of a WebSocket connection.
pub struct FrameSender {
    id: ConnectionId,
    sink: SplitSink<ClientStream, Message>,
}

impl FrameSender {
    /// Encode and send one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the send fails.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Send a close frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake cannot be started.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        debug!(connection = %self.id, "Closing WebSocket");
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

/// Receiving half of a WebSocket connection.
pub struct FrameReceiver {
    id: ConnectionId,
    stream: SplitStream<ClientStream>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl FrameReceiver {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer has closed the connection.
    ///
    /// # Errors
    ///
    /// Returns an error on an oversized or undecodable frame, or a socket error.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        // First, try to decode from the existing buffer
        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(
                            connection = %self.id,
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            self.max_message_size
                        );
                        return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(
                            data.len(),
                        )));
                    }

                    self.read_buffer.extend_from_slice(&data);
                    if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    self.read_buffer.extend_from_slice(text.as_bytes());
                    if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                // tungstenite queues the pong and sends it with the next write
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(connection = %self.id, "WebSocket error: {}", e);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }
}
