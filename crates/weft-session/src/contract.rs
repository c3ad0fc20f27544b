//! Service and method contracts.
//!
//! A [`ServiceContract`] aggregates the callable operations of one
//! service. It is assembled inside [`ServiceContract::define`] - the
//! setup phase - and immutable afterward. Each [`MethodContract`]
//! captures the method's call pattern, its declarative metadata, and a
//! type-erased handler with the codecs baked in.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use weft_wire::Status;

use crate::dispatch::{
    BidiStreamMethod, ClientStreamMethod, RawHandler, ServerStreamMethod, UnaryMethod,
};
use crate::{CallContext, Codec, RequestStream, Responder};

/// The four call patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStreaming,
    /// A stream of requests, one response.
    ClientStreaming,
    /// Streams in both directions.
    BidiStreaming,
}

/// Declarative method metadata.
///
/// The runtime acts on `timeout` (deadline enforcement at the
/// originator); the remaining keys are carried for middleware and
/// tooling. Unknown keys are preserved in `extra`.
#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    pub timeout: Option<Duration>,
    pub requires_auth: bool,
    pub permissions: Vec<String>,
    pub cacheable: bool,
    pub cache_timeout: Option<Duration>,
    pub retry_count: u32,
    pub deprecated: bool,
    pub since: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl MethodOptions {
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn requires_auth(&mut self) -> &mut Self {
        self.requires_auth = true;
        self
    }

    pub fn permissions(&mut self, permissions: impl IntoIterator<Item = String>) -> &mut Self {
        self.permissions.extend(permissions);
        self
    }

    pub fn cacheable(&mut self, cache_timeout: Duration) -> &mut Self {
        self.cacheable = true;
        self.cache_timeout = Some(cache_timeout);
        self
    }

    pub fn retry_count(&mut self, retries: u32) -> &mut Self {
        self.retry_count = retries;
        self
    }

    pub fn deprecated(&mut self, since: impl Into<String>) -> &mut Self {
        self.deprecated = true;
        self.since = Some(since.into());
        self
    }

    /// Attach a key the runtime does not interpret.
    pub fn extra(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.extra.push((key.into(), value.into()));
        self
    }
}

/// Immutable description of one callable operation.
pub struct MethodContract {
    service: String,
    method: String,
    method_type: MethodType,
    options: MethodOptions,
    handler: Arc<dyn RawHandler>,
}

impl MethodContract {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    pub fn options(&self) -> &MethodOptions {
        &self.options
    }

    pub(crate) fn handler(&self) -> Arc<dyn RawHandler> {
        self.handler.clone()
    }
}

impl std::fmt::Debug for MethodContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodContract")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("method_type", &self.method_type)
            .finish_non_exhaustive()
    }
}

/// The method contracts of one service, keyed by method name.
pub struct ServiceContract {
    name: String,
    methods: Vec<MethodContract>,
}

impl ServiceContract {
    /// Define a service. `build` receives the registrar and adds
    /// methods; the returned contract is immutable.
    pub fn define(name: impl Into<String>, build: impl FnOnce(&mut ServiceBuilder)) -> Self {
        let name = name.into();
        let mut builder = ServiceBuilder {
            name: name.clone(),
            methods: Vec::new(),
        };
        build(&mut builder);
        Self {
            name,
            methods: builder.methods,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&MethodContract> {
        self.methods.iter().find(|m| m.method == name)
    }

    pub fn methods(&self) -> &[MethodContract] {
        &self.methods
    }

    pub(crate) fn into_parts(self) -> (String, Vec<MethodContract>) {
        (self.name, self.methods)
    }
}

/// Registrar passed to [`ServiceContract::define`].
pub struct ServiceBuilder {
    name: String,
    methods: Vec<MethodContract>,
}

impl ServiceBuilder {
    /// Register a unary method: one request in, one response out.
    ///
    /// Returns the method's options for declarative metadata:
    ///
    /// ```ignore
    /// svc.unary("add", PostcardCodec::new(), PostcardCodec::new(), handler)
    ///     .timeout(Duration::from_secs(2));
    /// ```
    pub fn unary<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
        handler: F,
    ) -> &mut MethodOptions
    where
        Req: Send + 'static,
        Resp: Send + Sync + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.push(
            method,
            MethodType::Unary,
            Arc::new(UnaryMethod {
                request_codec: Arc::new(request_codec),
                response_codec: Arc::new(response_codec),
                handler: Arc::new(handler),
            }),
        )
    }

    /// Register a server-streaming method: one request in, a pull-driven
    /// sequence of responses out.
    pub fn server_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
        handler: F,
    ) -> &mut MethodOptions
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(CallContext, Req, Responder<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.push(
            method,
            MethodType::ServerStreaming,
            Arc::new(ServerStreamMethod {
                request_codec: Arc::new(request_codec),
                response_codec: Arc::new(response_codec),
                handler: Arc::new(handler),
            }),
        )
    }

    /// Register a client-streaming method: a sequence of requests in,
    /// one response out. The request sequence may be empty.
    pub fn client_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
        handler: F,
    ) -> &mut MethodOptions
    where
        Req: Send + 'static,
        Resp: Send + Sync + 'static,
        F: Fn(CallContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.push(
            method,
            MethodType::ClientStreaming,
            Arc::new(ClientStreamMethod {
                request_codec: Arc::new(request_codec),
                response_codec: Arc::new(response_codec),
                handler: Arc::new(handler),
            }),
        )
    }

    /// Register a bidirectional method: streams in both directions,
    /// interleaved freely until each side half-closes.
    pub fn bidi_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
        handler: F,
    ) -> &mut MethodOptions
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(CallContext, RequestStream<Req>, Responder<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.push(
            method,
            MethodType::BidiStreaming,
            Arc::new(BidiStreamMethod {
                request_codec: Arc::new(request_codec),
                response_codec: Arc::new(response_codec),
                handler: Arc::new(handler),
            }),
        )
    }

    fn push(
        &mut self,
        method: &str,
        method_type: MethodType,
        handler: Arc<dyn RawHandler>,
    ) -> &mut MethodOptions {
        self.methods.push(MethodContract {
            service: self.name.clone(),
            method: method.to_string(),
            method_type,
            options: MethodOptions::default(),
            handler,
        });
        let last = self.methods.len() - 1;
        &mut self.methods[last].options
    }
}
