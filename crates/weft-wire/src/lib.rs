#![deny(unsafe_code)]

//! Wire-level types for the weft RPC runtime.
//!
//! One [`Envelope`] is one logical RPC event on the transport: stream
//! begin, a payload message, a half-close, a terminal status, or a
//! cancellation. [`codec`] maps envelopes to and from the self-delimiting
//! binary frame format.

mod envelope;
pub use envelope::*;

mod status;
pub use status::*;

mod stream_id;
pub use stream_id::*;

pub mod codec;
