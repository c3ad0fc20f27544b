//! Payload codecs.
//!
//! A [`Codec`] is a serialize/deserialize pair for one message type. The
//! runtime makes no assumption about the format: contracts and call
//! builders carry codec objects, and payloads travel as opaque bytes
//! everywhere else.

use std::marker::PhantomData;

use facet::Facet;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::CodecError;

/// A serialize/deserialize pair for message type `T`.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Postcard codec via facet reflection. The default payload format.
pub struct PostcardCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> PostcardCodec<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for PostcardCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PostcardCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for PostcardCodec<T> {}

impl<T: Facet<'static>> Codec<T> for PostcardCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        facet_postcard::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        facet_postcard::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// JSON codec via serde, for payloads that need to be inspectable or
/// cross language boundaries.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for JsonCodec<T> {}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Facet)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn postcard_roundtrip() {
        let codec = PostcardCodec::new();
        let point = Point { x: -3, y: 7 };
        let bytes = codec.encode(&point).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), point);
    }

    #[test]
    fn postcard_decode_garbage_fails() {
        let codec = PostcardCodec::<Point>::new();
        assert!(codec.decode(&[0xff]).is_err());
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Named {
        name: String,
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec::new();
        let value = Named {
            name: "weft".into(),
        };
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }
}
