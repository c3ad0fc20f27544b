#![deny(unsafe_code)]

//! In-memory transport for weft endpoints.
//!
//! This crate provides a bidirectional in-memory [`MemoryTransport`]
//! pair that implements [`weft_session::Transport`]. It is useful for
//! tests, benchmarks, and embedding scenarios where no OS transport is
//! needed.
//!
//! # Example
//!
//! ```ignore
//! use weft_memory::memory_transport_pair;
//! use weft_session::{Endpoint, EndpointConfig};
//!
//! let (client_io, server_io) = memory_transport_pair(64);
//! let (client, client_engine) = Endpoint::client(client_io, EndpointConfig::default());
//! let (server, server_engine) = Endpoint::server(server_io, EndpointConfig::default());
//! tokio::spawn(async move { let _ = client_engine.run().await; });
//! tokio::spawn(async move { let _ = server_engine.run().await; });
//! ```

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;
use weft_session::Transport;

/// A frame transport backed by in-process channels.
///
/// Create connected endpoints with [`memory_transport_pair`]. Frame
/// boundaries are preserved by construction: one `send` is one channel
/// message.
pub struct MemoryTransport {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    closed: bool,
}

/// Create a connected pair of in-memory transports.
///
/// `buffer` is the channel capacity for each direction; senders suspend
/// when it fills, so backpressure behaves like a real transport.
pub fn memory_transport_pair(buffer: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::channel(buffer);
    let (b_to_a_tx, b_to_a_rx) = mpsc::channel(buffer);

    let a = MemoryTransport {
        tx: a_to_b_tx,
        rx: b_to_a_rx,
        closed: false,
    };
    let b = MemoryTransport {
        tx: b_to_a_tx,
        rx: a_to_b_rx,
        closed: false,
    };
    (a, b)
}

impl Transport for MemoryTransport {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer disconnected"))
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_pass_through_in_order() {
        let (mut a, mut b) = memory_transport_pair(8);
        a.send(Bytes::from_static(b"first")).await.unwrap();
        a.send(Bytes::from_static(b"second")).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), &b"first"[..]);
        assert_eq!(b.recv().await.unwrap().unwrap(), &b"second"[..]);
    }

    #[tokio::test]
    async fn recv_returns_none_when_peer_dropped() {
        let (a, mut b) = memory_transport_pair(8);
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_fails_when_peer_is_dropped() {
        let (mut a, b) = memory_transport_pair(8);
        drop(b);

        let err = a.send(Bytes::from_static(b"hello")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_sends() {
        let (mut a, _b) = memory_transport_pair(8);
        a.close().await.unwrap();
        a.close().await.unwrap();

        let err = a.send(Bytes::from_static(b"late")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
