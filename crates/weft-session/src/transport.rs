//! Frame transport abstraction.
//!
//! The engine runs over anything that can ship opaque byte frames in
//! order, reliably, in both directions, preserving frame boundaries
//! (each `send` surfaces as exactly one `recv` on the peer). Logical
//! RPC framing is the envelope codec's job, not the transport's.
//!
//! Implementations:
//! - `MemoryTransport` from `weft-memory` for in-process pairs
//! - `StreamTransport` from `weft-tcp` for TCP and other byte streams

use std::future::Future;
use std::io;

use bytes::Bytes;

/// A bidirectional, ordered, reliable channel of opaque byte frames.
pub trait Transport: Send + 'static {
    /// Send one frame. Returns once the transport has accepted it;
    /// may suspend under backpressure. Fails if the transport is shut
    /// down.
    fn send(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next frame. `Ok(None)` means the peer closed the
    /// transport cleanly; an error means it failed.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;

    /// Close the transport. Idempotent; flushes pending sends
    /// best-effort.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}
