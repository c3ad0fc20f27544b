//! Binary envelope codec.
//!
//! Each envelope is a self-delimiting frame:
//!
//! ```text
//! frame     := len:u32be  kind:u8  stream_id:u64be  body
//! str/bytes := len:u32be  raw bytes
//! metadata  := count:u32be  (key:str value:str)*
//! BEGIN     := service:str  method:str  metadata
//! MESSAGE   := payload:bytes
//! HALF_CLOSE:= (empty)
//! STATUS    := code:u8  message:str  has_details:u8  [details:bytes]  metadata
//! CANCEL    := (empty)
//! ```
//!
//! `len` counts everything after the length prefix. Known fields are
//! read front-to-back; any trailing bytes in the body are skipped, so a
//! newer peer can append fields without breaking older decoders.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{Envelope, Kind, Metadata, MethodKey, Status, StatusCode, StreamId};

/// Maximum frame size (16 MiB), counted after the length prefix.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Fixed header after the length prefix: kind byte plus stream ID.
pub const FRAME_HEADER_SIZE: usize = 1 + 8;

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    /// Unknown envelope kind byte.
    #[error("unknown envelope kind: {0}")]
    UnknownKind(u8),

    /// Frame body ended before a declared field.
    #[error("truncated frame while reading {0}")]
    Truncated(&'static str),

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A transport frame carried bytes beyond one envelope.
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
}

/// Encode an envelope onto the end of `buf`.
pub fn encode(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), WireError> {
    let mut body = BytesMut::new();
    match envelope {
        Envelope::Begin {
            method, metadata, ..
        } => {
            put_str(&mut body, &method.service);
            put_str(&mut body, &method.method);
            put_metadata(&mut body, metadata);
        }
        Envelope::Message { payload, .. } => {
            put_bytes(&mut body, payload);
        }
        Envelope::HalfClose { .. } | Envelope::Cancel { .. } => {}
        Envelope::Status {
            status, metadata, ..
        } => {
            body.put_u8(status.code.as_wire());
            put_str(&mut body, &status.message);
            match &status.details {
                Some(details) => {
                    body.put_u8(1);
                    put_bytes(&mut body, details);
                }
                None => body.put_u8(0),
            }
            put_metadata(&mut body, metadata);
        }
    }

    let len = (FRAME_HEADER_SIZE + body.len()) as u64;
    if len > MAX_FRAME_SIZE as u64 {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    buf.reserve(LEN_PREFIX_SIZE + len as usize);
    buf.put_u32(len as u32);
    buf.put_u8(envelope.kind().as_wire());
    buf.put_u64(envelope.stream_id().raw());
    buf.put_slice(&body);
    Ok(())
}

/// Encode an envelope into a fresh buffer.
pub fn encode_to_bytes(envelope: &Envelope) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::new();
    encode(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Attempt to decode one envelope from the front of `buf`.
///
/// Returns `Ok(None)` if the buffer does not yet hold a complete frame.
/// On success the consumed bytes are removed from the buffer.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
    if buf.len() < LEN_PREFIX_SIZE {
        return Ok(None);
    }

    let mut peek = &buf[..];
    let len = peek.get_u32();
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len as u64,
            max: MAX_FRAME_SIZE,
        });
    }
    if (len as usize) < FRAME_HEADER_SIZE {
        return Err(WireError::Truncated("frame header"));
    }
    if buf.len() < LEN_PREFIX_SIZE + len as usize {
        return Ok(None);
    }

    buf.advance(LEN_PREFIX_SIZE);
    let frame = buf.split_to(len as usize);
    decode_body(&frame).map(Some)
}

/// Decode a transport frame holding exactly one envelope.
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, WireError> {
    let mut buf = BytesMut::from(frame);
    match decode(&mut buf)? {
        Some(envelope) if buf.is_empty() => Ok(envelope),
        Some(_) => Err(WireError::TrailingBytes(buf.len())),
        None => Err(WireError::Truncated("frame")),
    }
}

fn decode_body(frame: &[u8]) -> Result<Envelope, WireError> {
    let mut r = Reader { buf: frame };
    let kind_byte = r.u8("kind")?;
    let kind = Kind::from_wire(kind_byte).ok_or(WireError::UnknownKind(kind_byte))?;
    let stream_id = StreamId::new(r.u64("stream id")?);

    // Trailing bytes beyond the fields read here are deliberately ignored.
    let envelope = match kind {
        Kind::Begin => {
            let service = r.string("service name")?;
            let method = r.string("method name")?;
            let metadata = r.metadata()?;
            Envelope::Begin {
                stream_id,
                method: MethodKey { service, method },
                metadata,
            }
        }
        Kind::Message => Envelope::Message {
            stream_id,
            payload: Bytes::copy_from_slice(r.bytes("payload")?),
        },
        Kind::HalfClose => Envelope::HalfClose { stream_id },
        Kind::Status => {
            let code = StatusCode::from_wire(r.u8("status code")?);
            let message = r.string("status message")?;
            let details = if r.u8("details flag")? != 0 {
                Some(Bytes::copy_from_slice(r.bytes("status details")?))
            } else {
                None
            };
            let metadata = r.metadata()?;
            Envelope::Status {
                stream_id,
                status: Status {
                    code,
                    message,
                    details,
                },
                metadata,
            }
        }
        Kind::Cancel => Envelope::Cancel { stream_id },
    };
    Ok(envelope)
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_metadata(buf: &mut BytesMut, metadata: &Metadata) {
    buf.put_u32(metadata.len() as u32);
    for (key, value) in metadata {
        put_str(buf, key);
        put_str(buf, value);
    }
}

/// Bounds-checked front-to-back field reader.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self, what: &'static str) -> Result<u8, WireError> {
        if self.buf.is_empty() {
            return Err(WireError::Truncated(what));
        }
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        if self.buf.len() < 4 {
            return Err(WireError::Truncated(what));
        }
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, WireError> {
        if self.buf.len() < 8 {
            return Err(WireError::Truncated(what));
        }
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, what: &'static str) -> Result<&'a [u8], WireError> {
        let len = self.u32(what)? as usize;
        if self.buf.len() < len {
            return Err(WireError::Truncated(what));
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn string(&mut self, what: &'static str) -> Result<String, WireError> {
        let raw = self.bytes(what)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8(what))
    }

    fn metadata(&mut self) -> Result<Metadata, WireError> {
        let count = self.u32("metadata count")? as usize;
        // Each entry needs at least two length prefixes.
        if count > self.buf.len() / 8 + 1 {
            return Err(WireError::Truncated("metadata"));
        }
        let mut metadata = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.string("metadata key")?;
            let value = self.string("metadata value")?;
            metadata.push((key, value));
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: Envelope) {
        let mut buf = BytesMut::new();
        encode(&envelope, &mut buf).unwrap();
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_all_kinds() {
        roundtrip(Envelope::Begin {
            stream_id: StreamId(2),
            method: MethodKey::new("Calc", "add"),
            metadata: vec![("trace-id".into(), "abc123".into())],
        });
        roundtrip(Envelope::Message {
            stream_id: StreamId(2),
            payload: Bytes::from_static(b"\x00\x01\x02payload"),
        });
        roundtrip(Envelope::HalfClose {
            stream_id: StreamId(7),
        });
        roundtrip(Envelope::Status {
            stream_id: StreamId(2),
            status: Status::unimplemented("no such method").with_details(vec![1, 2, 3]),
            metadata: vec![("retry-after".into(), "100".into())],
        });
        roundtrip(Envelope::Cancel {
            stream_id: StreamId(4),
        });
    }

    #[test]
    fn empty_message_and_metadata() {
        roundtrip(Envelope::Message {
            stream_id: StreamId(2),
            payload: Bytes::new(),
        });
        roundtrip(Envelope::Begin {
            stream_id: StreamId(2),
            method: MethodKey::new("", ""),
            metadata: vec![],
        });
        roundtrip(Envelope::Status {
            stream_id: StreamId(2),
            status: Status::ok(),
            metadata: vec![],
        });
    }

    #[test]
    fn incomplete_buffer_returns_none() {
        let envelope = Envelope::Message {
            stream_id: StreamId(2),
            payload: Bytes::from_static(b"hello"),
        };
        let encoded = encode_to_bytes(&envelope).unwrap();

        for cut in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(decode(&mut buf).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn decode_interleaved_frames() {
        let first = Envelope::HalfClose {
            stream_id: StreamId(2),
        };
        let second = Envelope::Cancel {
            stream_id: StreamId(4),
        };

        let mut buf = BytesMut::new();
        encode(&first, &mut buf).unwrap();
        encode(&second, &mut buf).unwrap();

        assert_eq!(decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), second);
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_trailing_body_bytes_are_skipped() {
        // A newer peer appends a field to HALF_CLOSE; we must still decode.
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_HEADER_SIZE + 5) as u32);
        buf.put_u8(Kind::HalfClose.as_wire());
        buf.put_u64(6);
        buf.put_slice(b"extra");

        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            Envelope::HalfClose {
                stream_id: StreamId(6)
            }
        );
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(FRAME_HEADER_SIZE as u32);
        buf.put_u8(9);
        buf.put_u64(2);

        assert!(matches!(decode(&mut buf), Err(WireError::UnknownKind(9))));
    }

    #[test]
    fn unknown_status_code_maps_to_unknown() {
        let mut buf = BytesMut::new();
        let envelope = Envelope::Status {
            stream_id: StreamId(2),
            status: Status::ok(),
            metadata: vec![],
        };
        encode(&envelope, &mut buf).unwrap();
        // Patch the status code byte (right after kind + stream id).
        buf[LEN_PREFIX_SIZE + FRAME_HEADER_SIZE] = 99;

        match decode(&mut buf).unwrap().unwrap() {
            Envelope::Status { status, .. } => assert_eq!(status.code, StatusCode::Unknown),
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[test]
    fn truncated_body_is_an_error() {
        // MESSAGE declaring a 100-byte payload but carrying none.
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_HEADER_SIZE + 4) as u32);
        buf.put_u8(Kind::Message.as_wire());
        buf.put_u64(2);
        buf.put_u32(100);

        assert!(matches!(decode(&mut buf), Err(WireError::Truncated(_))));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE + 1);
        buf.put_u8(Kind::Cancel.as_wire());

        assert!(matches!(
            decode(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn decode_frame_rejects_trailing_bytes() {
        let envelope = Envelope::Cancel {
            stream_id: StreamId(2),
        };
        let mut encoded = encode_to_bytes(&envelope).unwrap().to_vec();
        encoded.push(0xff);

        assert!(matches!(
            decode_frame(&encoded),
            Err(WireError::TrailingBytes(1))
        ));
    }

    #[test]
    fn metadata_count_cannot_overcommit() {
        // Claims u32::MAX entries with a near-empty body; must not OOM.
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_HEADER_SIZE + 4 + 4 + 4) as u32);
        buf.put_u8(Kind::Begin.as_wire());
        buf.put_u64(2);
        put_str(&mut buf, "");
        put_str(&mut buf, "");
        buf.put_u32(u32::MAX);

        assert!(matches!(decode(&mut buf), Err(WireError::Truncated(_))));
    }
}
