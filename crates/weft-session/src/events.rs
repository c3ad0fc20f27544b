//! Diagnostic events.
//!
//! The engine publishes lifecycle events on an optional unbounded
//! channel and never calls into a diagnostics consumer directly, so a
//! sink that itself logs cannot recurse back into the runtime.

use weft_wire::{MethodKey, StatusCode, StreamId};

/// Lifecycle event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// A logical stream was created (outbound call or inbound `BEGIN`).
    StreamOpened {
        stream_id: StreamId,
        method: MethodKey,
    },
    /// A logical stream reached its terminal state.
    StreamClosed {
        stream_id: StreamId,
        code: StatusCode,
    },
    /// The transport closed or failed; the engine is done.
    TransportClosed,
}
