use bytes::Bytes;

use crate::{Status, StreamId};

/// Ordered key/value string pairs carried on `BEGIN` and `STATUS`
/// envelopes. Duplicate keys are allowed; order is preserved.
pub type Metadata = Vec<(String, String)>;

/// Identifies one callable operation: service name plus method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub service: String,
    pub method: String,
}

impl MethodKey {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }
}

impl std::fmt::Display for MethodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Envelope kind codes. Wire-significant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Begin = 1,
    Message = 2,
    HalfClose = 3,
    Status = 4,
    Cancel = 5,
}

impl Kind {
    /// Decode a wire byte. Unknown kinds are a decode error, not a
    /// skippable field.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Kind::Begin),
            2 => Some(Kind::Message),
            3 => Some(Kind::HalfClose),
            4 => Some(Kind::Status),
            5 => Some(Kind::Cancel),
            _ => None,
        }
    }

    /// The wire byte for this kind.
    pub const fn as_wire(self) -> u8 {
        self as u8
    }
}

/// The unit on the transport: one logical RPC event.
///
/// Per stream, `Begin` appears at most once and first; `Status` is
/// terminal for its direction; `Message` payloads are delivered in send
/// order; `HalfClose` means the sender will emit no more `Message`
/// envelopes on that stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Opens a stream for the named method.
    Begin {
        stream_id: StreamId,
        method: MethodKey,
        metadata: Metadata,
    },
    /// One request or response payload.
    Message { stream_id: StreamId, payload: Bytes },
    /// The sender is done sending on this stream.
    HalfClose { stream_id: StreamId },
    /// Terminal status; no further envelopes follow in this direction.
    Status {
        stream_id: StreamId,
        status: Status,
        metadata: Metadata,
    },
    /// Abort the stream from either side.
    Cancel { stream_id: StreamId },
}

impl Envelope {
    /// The stream this envelope belongs to.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Envelope::Begin { stream_id, .. }
            | Envelope::Message { stream_id, .. }
            | Envelope::HalfClose { stream_id }
            | Envelope::Status { stream_id, .. }
            | Envelope::Cancel { stream_id } => *stream_id,
        }
    }

    /// The envelope's kind code.
    pub fn kind(&self) -> Kind {
        match self {
            Envelope::Begin { .. } => Kind::Begin,
            Envelope::Message { .. } => Kind::Message,
            Envelope::HalfClose { .. } => Kind::HalfClose,
            Envelope::Status { .. } => Kind::Status,
            Envelope::Cancel { .. } => Kind::Cancel,
        }
    }
}
