#![deny(unsafe_code)]

//! Byte-stream transport for weft endpoints.
//!
//! Wraps any `AsyncRead + AsyncWrite` pair (TCP, Unix sockets, stdio)
//! in 4-byte big-endian length-prefix framing so frame boundaries
//! survive the stream. The prefix is transport framing, opaque to the
//! envelope codec running above it.
//!
//! # Example
//!
//! ```ignore
//! use weft_session::{Endpoint, EndpointConfig};
//! use weft_tcp::StreamTransport;
//!
//! let io = StreamTransport::connect("127.0.0.1:9000").await?;
//! let (endpoint, engine) = Endpoint::client(io, EndpointConfig::default());
//! tokio::spawn(async move { let _ = engine.run().await; });
//! ```

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::trace;
use weft_session::Transport;

/// Largest frame accepted off the stream (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// A length-prefix framed byte-stream transport.
///
/// Each frame is `[len: u32 BE][payload bytes]`.
pub struct StreamTransport<S> {
    stream: S,
    recv_buf: BytesMut,
    closed: bool,
}

impl<S> StreamTransport<S> {
    /// Wrap an async byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            recv_buf: BytesMut::new(),
            closed: false,
        }
    }

    /// Get a reference to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Consume the wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl StreamTransport<TcpStream> {
    /// Connect to a TCP peer.
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

/// Transport over a TCP socket.
pub type TcpTransport = StreamTransport<TcpStream>;

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        if frame.len() as u64 > MAX_FRAME_SIZE as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds maximum", frame.len()),
            ));
        }
        let header = (frame.len() as u32).to_be_bytes();
        self.stream.write_all(&header).await?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        trace!(len = frame.len(), "frame sent");
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if self.recv_buf.len() >= 4 {
                let len = u32::from_be_bytes([
                    self.recv_buf[0],
                    self.recv_buf[1],
                    self.recv_buf[2],
                    self.recv_buf[3],
                ]);
                if len > MAX_FRAME_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("peer announced a {len}-byte frame"),
                    ));
                }
                if self.recv_buf.len() >= 4 + len as usize {
                    self.recv_buf.advance(4);
                    let frame = self.recv_buf.split_to(len as usize).freeze();
                    trace!(len = frame.len(), "frame received");
                    return Ok(Some(frame));
                }
            }

            let mut tmp = [0u8; 8192];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                if !self.recv_buf.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {} trailing bytes mid-frame", self.recv_buf.len()),
                    ));
                }
                return Ok(None);
            }
            self.recv_buf.extend_from_slice(&tmp[..n]);
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await
    }
}
