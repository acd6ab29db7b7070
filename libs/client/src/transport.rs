//! Transport seam: wire framing, the transport trait, and the TCP
//! implementation.
//!
//! Frames are length-prefixed on the wire: a u32 big-endian size followed
//! by a bincode-encoded [`WireFrame`]. The connection layer encodes and
//! decodes; transports move opaque bytes. The [`TransportConnector`]
//! factory is the seam the connect/reconnect policy is tested through
//! without sockets.

use crate::error::ClientError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use config::Tuning;
use types::{DeliveryMode, Destination, Message, MessageMetadata};

/// Maximum frame size in bytes (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One message as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub destination: Destination,
    pub reply_to: Option<Destination>,
    pub correlation_id: Option<String>,
    pub delivery_mode: DeliveryMode,
    /// Broker-side delivery delay in milliseconds
    pub delivery_delay_ms: u64,
    /// Time-to-live in milliseconds; 0 means no expiration
    pub expiration_ms: u64,
    pub payload: Vec<u8>,
}

impl WireFrame {
    /// Build a frame from a message whose metadata carries a destination.
    pub fn from_message(message: &Message) -> Result<Self, ClientError> {
        let destination = message
            .metadata
            .destination
            .clone()
            .ok_or_else(|| ClientError::invalid_value("message has no destination"))?;

        Ok(Self {
            destination,
            reply_to: message.metadata.reply_to.clone(),
            correlation_id: message.metadata.correlation_id.clone(),
            delivery_mode: message.metadata.delivery_mode,
            delivery_delay_ms: message.metadata.delivery_delay.as_millis() as u64,
            expiration_ms: message
                .metadata
                .time_to_live
                .map_or(0, |ttl| ttl.as_millis() as u64),
            payload: message.payload.clone(),
        })
    }

    /// Reconstruct the message a received frame carries.
    pub fn into_message(self) -> Message {
        let mut metadata = MessageMetadata::new()
            .with_destination(self.destination)
            .with_delivery_mode(self.delivery_mode)
            .with_delivery_delay(Duration::from_millis(self.delivery_delay_ms));
        if let Some(reply_to) = self.reply_to {
            metadata = metadata.with_reply_to(reply_to);
        }
        if let Some(id) = self.correlation_id {
            metadata = metadata.with_correlation_id(id);
        }
        if self.expiration_ms != 0 {
            metadata = metadata.with_time_to_live(Duration::from_millis(self.expiration_ms));
        }

        Message {
            payload: self.payload,
            metadata,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ClientError> {
        let encoded = bincode::serialize(self)
            .map_err(|e| ClientError::invalid_value(format!("frame encode: {e}")))?;
        Ok(Bytes::from(encoded))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ClientError> {
        bincode::deserialize(bytes)
            .map_err(|e| ClientError::invalid_value(format!("frame decode: {e}")))
    }
}

/// Events produced by a transport's receive side.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete inbound frame
    Frame(Bytes),
    /// A multicast-level gap (packet loss, daemon hiccup). Non-fatal.
    MulticastGap { status: i32, description: String },
    /// The transport is gone; triggers the reconnect policy.
    Closed { reason: String },
}

/// A live transport to a broker endpoint.
///
/// Methods take `&self`; implementations guard their halves internally so
/// the reader task and caller threads can share one instance.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Hand one encoded frame to the transport.
    async fn send(&self, frame: Bytes) -> Result<(), ClientError>;

    /// Wait for the next inbound event. After returning
    /// [`TransportEvent::Closed`] the transport yields only `Closed`.
    async fn recv(&self) -> TransportEvent;

    /// Best-effort shutdown of the underlying link.
    async fn shutdown(&self);
}

/// Factory that produces a connected transport. The connect and reconnect
/// loops call this once per attempt.
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ClientError>;

    /// Human-readable endpoint for logs and metadata.
    fn endpoint(&self) -> String;
}

/// TCP transport with u32-BE length-prefixed frames.
#[derive(Debug)]
pub struct TcpTransport {
    peer_addr: SocketAddr,
    reader: Mutex<ReadSide>,
    writer: Mutex<WriteSide>,
    max_frame_size: usize,
}

#[derive(Debug)]
struct ReadSide {
    half: OwnedReadHalf,
    buffer: BytesMut,
    closed: bool,
}

#[derive(Debug)]
struct WriteSide {
    half: OwnedWriteHalf,
    buffer: BytesMut,
}

impl TcpTransport {
    fn new(stream: tokio::net::TcpStream, peer_addr: SocketAddr, max_frame_size: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            peer_addr,
            reader: Mutex::new(ReadSide {
                half: read_half,
                buffer: BytesMut::with_capacity(64 * 1024),
                closed: false,
            }),
            writer: Mutex::new(WriteSide {
                half: write_half,
                buffer: BytesMut::with_capacity(64 * 1024),
            }),
            max_frame_size,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: Bytes) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;

        // Single write call: length prefix and body share one buffer
        writer.buffer.clear();
        writer
            .buffer
            .extend_from_slice(&(frame.len() as u32).to_be_bytes());
        writer.buffer.extend_from_slice(&frame);

        let buffered: Bytes = writer.buffer.split().freeze();
        writer
            .half
            .write_all(&buffered)
            .await
            .map_err(|e| ClientError::ConnectionLost(format!("write to {}: {e}", self.peer_addr)))?;
        writer
            .half
            .flush()
            .await
            .map_err(|e| ClientError::ConnectionLost(format!("flush to {}: {e}", self.peer_addr)))?;

        debug!(peer = %self.peer_addr, bytes = frame.len(), "sent frame");
        Ok(())
    }

    async fn recv(&self) -> TransportEvent {
        let mut reader = self.reader.lock().await;
        if reader.closed {
            return TransportEvent::Closed {
                reason: "transport already closed".to_string(),
            };
        }

        let mut len_bytes = [0u8; 4];
        if let Err(e) = reader.half.read_exact(&mut len_bytes).await {
            reader.closed = true;
            return TransportEvent::Closed {
                reason: format!("read from {}: {e}", self.peer_addr),
            };
        }

        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > self.max_frame_size {
            reader.closed = true;
            return TransportEvent::Closed {
                reason: format!(
                    "frame size {frame_len} exceeds maximum {}",
                    self.max_frame_size
                ),
            };
        }

        reader.buffer.resize(frame_len, 0);
        let mut body = reader.buffer.split();
        if let Err(e) = reader.half.read_exact(&mut body).await {
            reader.closed = true;
            return TransportEvent::Closed {
                reason: format!("read from {}: {e}", self.peer_addr),
            };
        }

        debug!(peer = %self.peer_addr, bytes = frame_len, "received frame");
        TransportEvent::Frame(body.freeze())
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.half.shutdown().await {
            debug!(peer = %self.peer_addr, "shutdown: {e}");
        }
    }
}

/// Connector that dials a `host:port` endpoint over TCP, applying the
/// socket buffer sizing from the tuning snapshot.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: String,
    tuning: Tuning,
}

impl TcpConnector {
    pub fn new(endpoint: impl Into<String>, tuning: Tuning) -> Self {
        Self {
            endpoint: endpoint.into(),
            tuning,
        }
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ClientError> {
        let addr = lookup_host(&self.endpoint)
            .await
            .map_err(|e| ClientError::Io(format!("resolve {}: {e}", self.endpoint)))?
            .next()
            .ok_or_else(|| ClientError::Io(format!("no address for {}", self.endpoint)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| ClientError::Io(format!("socket: {e}")))?;

        if let Some(kb) = self.tuning.socket_receive_buffer_kb {
            if let Err(e) = socket.set_recv_buffer_size(kb * 1024) {
                warn!(kb, "could not size receive buffer: {e}");
            }
        }
        if let Some(kb) = self.tuning.socket_send_buffer_kb {
            if let Err(e) = socket.set_send_buffer_size(kb * 1024) {
                warn!(kb, "could not size send buffer: {e}");
            }
        }

        let stream = socket
            .connect(addr)
            .await
            .map_err(|e| ClientError::Io(format!("connect {}: {e}", self.endpoint)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::Io(format!("nodelay: {e}")))?;

        debug!(endpoint = %self.endpoint, peer = %addr, "TCP transport connected");
        Ok(Arc::new(TcpTransport::new(
            stream,
            addr,
            DEFAULT_MAX_FRAME_SIZE,
        )))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}
