use std::io;

use thiserror::Error;
use weft_wire::codec::WireError;
use weft_wire::{Status, StatusCode};

use crate::MethodType;

/// Error from a payload codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Error registering a service contract.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Service name already registered.
    #[error("service {0:?} is already registered")]
    DuplicateService(String),

    /// `(service, method)` key already registered.
    #[error("method {service}.{method} is already registered")]
    DuplicateMethod { service: String, method: String },
}

/// Error from making an outgoing call.
///
/// Peer failures arrive as terminal statuses and surface as
/// [`CallError::Status`]; everything local keeps its own variant.
#[derive(Debug, Error)]
pub enum CallError {
    /// The call ended with a non-OK terminal status, locally
    /// synthesized (cancel, deadline, endpoint closed) or from the peer.
    #[error("call ended with status {0}")]
    Status(Status),

    /// Failed to encode the request or decode the response.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The method is registered under a different call pattern than the
    /// builder used.
    #[error("method is registered as {actual:?}, not {expected:?}")]
    MethodTypeMismatch {
        expected: MethodType,
        actual: MethodType,
    },

    /// The engine task is gone.
    #[error("engine task stopped")]
    EngineGone,
}

impl CallError {
    /// The status code this error maps to.
    pub fn code(&self) -> StatusCode {
        match self {
            CallError::Status(status) => status.code,
            CallError::Codec(_) => StatusCode::Internal,
            CallError::MethodTypeMismatch { .. } => StatusCode::InvalidArgument,
            CallError::EngineGone => StatusCode::Unavailable,
        }
    }

    pub(crate) fn unavailable(message: &str) -> Self {
        CallError::Status(Status::unavailable(message))
    }
}

/// Error sending on an outbound stream.
#[derive(Debug, Error)]
pub enum SendError {
    /// The stream was cancelled.
    #[error("stream was cancelled")]
    Cancelled,

    /// `half_close` was already called on this side.
    #[error("stream is already half-closed")]
    HalfClosed,

    /// Failed to encode the outgoing message.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A middleware layer vetoed the message.
    #[error("message rejected by middleware: {0}")]
    Rejected(Status),

    /// The engine task is gone.
    #[error("engine task stopped")]
    EngineGone,
}

impl SendError {
    pub(crate) fn into_status(self) -> Status {
        match self {
            SendError::Cancelled => Status::cancelled("stream was cancelled"),
            SendError::HalfClosed => Status::internal("send after half-close"),
            SendError::Codec(e) => Status::internal(format!("encoding failed: {e}")),
            SendError::Rejected(status) => status,
            SendError::EngineGone => Status::unavailable("engine task stopped"),
        }
    }

    pub(crate) fn into_call_error(self) -> CallError {
        match self {
            SendError::Codec(e) => CallError::Codec(e),
            SendError::EngineGone => CallError::EngineGone,
            other => CallError::Status(other.into_status()),
        }
    }
}

/// Error that stops the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Outbound envelope could not be encoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}
