#![deny(unsafe_code)]

//! Session layer of the weft RPC runtime.
//!
//! An [`Endpoint`] multiplexes many concurrent logical calls over a single
//! [`Transport`]. The [`Engine`] owns the transport and demultiplexes
//! inbound envelopes to per-stream queues; every logical stream is driven
//! by its own task. Four call patterns are supported - unary,
//! server-streaming, client-streaming, and bidirectional - each a
//! cardinality constraint over the same stream machinery.
//!
//! # Example
//!
//! ```ignore
//! use weft_session::{Endpoint, EndpointConfig, PostcardCodec, ServiceContract};
//!
//! let contract = ServiceContract::define("Calc", |svc| {
//!     svc.unary(
//!         "add",
//!         PostcardCodec::new(),
//!         PostcardCodec::new(),
//!         |_cx, req: AddRequest| async move { Ok(AddResponse { sum: req.a + req.b }) },
//!     );
//! });
//!
//! let (endpoint, engine) = Endpoint::server(transport, EndpointConfig::default());
//! endpoint.register_service(contract)?;
//! tokio::spawn(async move { let _ = engine.run().await; });
//! ```

mod transport;
pub use transport::*;

mod config;
pub use config::*;

mod errors;
pub use errors::*;

mod codec;
pub use codec::*;

mod middleware;
pub use middleware::*;

mod contract;
pub use contract::*;

mod registry;
pub use registry::*;

mod streams;
pub use streams::*;

mod dispatch;
pub use dispatch::*;

mod engine;
pub use engine::*;

mod events;
pub use events::*;

mod endpoint;
pub use endpoint::*;

mod calls;
pub use calls::*;

pub use weft_wire::{
    Metadata, MethodKey, Role, Status, StatusCode, StreamId, StreamIdAllocator,
};

/// Depth of the engine's command queue.
pub(crate) const COMMAND_QUEUE_SIZE: usize = 1024;
