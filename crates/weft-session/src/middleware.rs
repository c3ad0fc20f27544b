//! Middleware for intercepting request and response payloads.
//!
//! Middleware hooks run per message, between the codec and the wire, on
//! both roles: a client runs `process_request` on outbound requests and
//! `process_response` on inbound responses; a server runs
//! `process_request` on inbound requests and `process_response` on
//! outbound responses. Hooks see encoded payload bytes, not typed
//! values, which keeps the chain object-safe and identical across the
//! four call patterns. A hook may veto a message by returning a
//! `Status`.
//!
//! Registration order is outer wrapping order: the first middleware
//! added sees requests first and responses last. Middleware must be
//! idempotent under message replay; the runtime never replays, but
//! diagnostics may re-observe.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use weft_wire::Status;

/// Boxed future returned by middleware hooks.
pub type MiddlewareFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, Status>> + Send + 'a>>;

/// An interceptor wrapping the request/response flow.
///
/// Both hooks default to pass-through. Hooks are async so middleware
/// can consult external state (token validation, quota lookups).
pub trait Middleware: Send + Sync {
    /// Intercept one request payload.
    fn process_request<'a>(
        &'a self,
        service: &'a str,
        method: &'a str,
        request: Vec<u8>,
    ) -> MiddlewareFuture<'a> {
        let _ = (service, method);
        Box::pin(async move { Ok(request) })
    }

    /// Intercept one response payload.
    fn process_response<'a>(
        &'a self,
        service: &'a str,
        method: &'a str,
        response: Vec<u8>,
    ) -> MiddlewareFuture<'a> {
        let _ = (service, method);
        Box::pin(async move { Ok(response) })
    }
}

/// An immutable snapshot of the registered middleware, taken when a
/// call opens or a handler is dispatched. Later `add_middleware` calls
/// affect subsequent calls only.
#[derive(Clone)]
pub(crate) struct MiddlewareChain {
    layers: Arc<[Arc<dyn Middleware>]>,
}

impl MiddlewareChain {
    pub(crate) fn snapshot(layers: &[Arc<dyn Middleware>]) -> Self {
        Self {
            layers: Arc::from(layers.to_vec()),
        }
    }

    /// Run the request hooks in registration order.
    pub(crate) async fn run_request(
        &self,
        service: &str,
        method: &str,
        mut payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        for layer in self.layers.iter() {
            payload = layer.process_request(service, method, payload).await?;
        }
        Ok(payload)
    }

    /// Run the response hooks in reverse order, so the outermost
    /// middleware sees the response last.
    pub(crate) async fn run_response(
        &self,
        service: &str,
        method: &str,
        mut payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        for layer in self.layers.iter().rev() {
            payload = layer.process_response(service, method, payload).await?;
        }
        Ok(payload)
    }
}
