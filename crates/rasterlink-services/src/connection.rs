//! Connection: one bidirectional byte stream speaking envelopes.
//!
//! A [`Connection`] splits its stream into a [`MessageReader`] and a
//! [`MessageWriter`]. Each half tracks its own liveness; the connection is
//! alive until the first I/O failure in either direction. Transport
//! failures are not returned as errors: a failed send marks the writer
//! disconnected and shuts it down, a failed or short read surfaces as
//! `Ok(None)`. Only codec violations, which make the rest of the stream
//! unreadable, come back as `Err`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use zerocopy::FromBytes;

use rasterlink_core::wire::{EnvelopeHeader, ENVELOPE_HEADER_LEN, MAX_ENVELOPE_PAYLOAD};
use rasterlink_core::{Message, WireError};

// ── Reader ───────────────────────────────────────────────────────────────────

/// Receiving half. Owned by exactly one task.
pub struct MessageReader<R> {
    inner: R,
    peer: String,
    connected: bool,
    receive_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, peer: impl Into<String>) -> Self {
        Self {
            inner,
            peer: peer.into(),
            connected: true,
            receive_timeout: None,
        }
    }

    /// Bound every receive by `timeout`. An elapsed deadline counts as a
    /// transport failure.
    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read the next message.
    ///
    /// `Ok(None)` means no message is available and never will be: the peer
    /// closed the stream, a read came up short, or the deadline elapsed.
    /// `Err` means the stream carried an undecodable envelope.
    pub async fn receive(&mut self) -> Result<Option<Message>, WireError> {
        if !self.connected {
            return Ok(None);
        }

        let read = match self.receive_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.read_envelope()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        peer = %self.peer,
                        timeout_secs = timeout.as_secs_f64(),
                        "receive deadline elapsed"
                    );
                    Ok(None)
                }
            },
            None => self.read_envelope().await,
        };

        match read {
            Ok(Some(message)) => {
                tracing::trace!(peer = %self.peer, %message, "read");
                Ok(Some(message))
            }
            Ok(None) => {
                self.connected = false;
                Ok(None)
            }
            Err(e) => {
                // Framing is lost; nothing after this can be trusted.
                tracing::warn!(peer = %self.peer, error = %e, "undecodable envelope");
                self.connected = false;
                Err(e)
            }
        }
    }

    async fn read_envelope(&mut self) -> Result<Option<Message>, WireError> {
        let mut header_buf = [0u8; ENVELOPE_HEADER_LEN];
        if let Err(e) = self.inner.read_exact(&mut header_buf).await {
            self.log_read_failure(&e);
            return Ok(None);
        }

        let header = match EnvelopeHeader::read_from(&header_buf[..]) {
            Some(h) => h,
            None => return Ok(None),
        };

        let length = header.payload_len();
        if length > MAX_ENVELOPE_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length as usize));
        }

        let mut payload = vec![0u8; length as usize];
        if length != 0 {
            if let Err(e) = self.inner.read_exact(&mut payload).await {
                self.log_read_failure(&e);
                return Ok(None);
            }
        }

        Message::decode(header.type_id, &payload).map(Some)
    }

    fn log_read_failure(&self, e: &std::io::Error) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            tracing::debug!(peer = %self.peer, "end of stream");
        } else {
            tracing::warn!(peer = %self.peer, error = %e, "read failed");
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Sending half. Owned by exactly one task.
pub struct MessageWriter<W> {
    inner: W,
    peer: String,
    connected: bool,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W, peer: impl Into<String>) -> Self {
        Self {
            inner,
            peer: peer.into(),
            connected: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write `type_id`, `length`, `payload`, in that order.
    ///
    /// An I/O failure marks the writer disconnected and shuts the stream
    /// down; callers observe it through [`Self::is_connected`]. `Err` is
    /// returned only when the message itself cannot be encoded.
    pub async fn send(&mut self, message: &Message) -> Result<(), WireError> {
        let envelope = message.to_envelope()?;
        if !self.connected {
            return Ok(());
        }

        let bytes = envelope.to_bytes();
        let written = async {
            self.inner.write_all(&bytes).await?;
            self.inner.flush().await
        }
        .await;

        match written {
            Ok(()) => tracing::trace!(peer = %self.peer, %message, "sent"),
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, %message, "send failed, disconnecting");
                self.close().await;
            }
        }
        Ok(())
    }

    /// Mark disconnected and shut the underlying stream down.
    pub async fn close(&mut self) {
        self.connected = false;
        let _ = self.inner.shutdown().await;
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// Both halves of one stream.
pub struct Connection<S> {
    reader: MessageReader<ReadHalf<S>>,
    writer: MessageWriter<WriteHalf<S>>,
}

impl Connection<TcpStream> {
    /// Open a TCP connection to `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_tcp(stream)
    }

    /// Wrap an accepted or connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a: SocketAddr| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self::new(stream, peer))
    }
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let peer = peer.into();
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(read_half, peer.clone()),
            writer: MessageWriter::new(write_half, peer),
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reader.set_receive_timeout(timeout);
        self
    }

    pub fn peer(&self) -> &str {
        self.reader.peer()
    }

    /// True until the first I/O failure in either direction.
    pub fn is_connected(&self) -> bool {
        self.reader.is_connected() && self.writer.is_connected()
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), WireError> {
        self.writer.send(message).await
    }

    pub async fn receive(&mut self) -> Result<Option<Message>, WireError> {
        let message = self.reader.receive().await;
        if !self.reader.is_connected() && self.writer.is_connected() {
            self.writer.close().await;
        }
        message
    }

    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Hand each direction to its own owner.
    pub fn into_split(self) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}
