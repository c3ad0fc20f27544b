//! Endpoint facade.
//!
//! The [`Endpoint`] is the user-facing handle: contract registration,
//! middleware, the four call builders, and shutdown. It shares state
//! with its [`Engine`] and stays cheap to clone.
//!
//! [`Engine`]: crate::Engine

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use weft_wire::{Role, StreamIdAllocator};

use crate::calls::CallSeed;
use crate::engine::EngineCommand;
use crate::middleware::MiddlewareChain;
use crate::{
    BidiRequest, CallError, ClientStreamRequest, Codec, EndpointConfig, Engine, MethodRegistry,
    MethodType, Middleware, RegistryError, ServerStreamRequest, ServiceContract, Transport,
    UnaryRequest, COMMAND_QUEUE_SIZE,
};

/// State shared between the endpoint handles and the engine.
pub(crate) struct EndpointShared {
    pub(crate) commands: mpsc::Sender<EngineCommand>,
    pub(crate) registry: MethodRegistry,
    pub(crate) middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    pub(crate) stream_ids: StreamIdAllocator,
    pub(crate) active: AtomicBool,
    pub(crate) stream_count: AtomicUsize,
    pub(crate) config: EndpointConfig,
    pub(crate) role: Role,
}

impl EndpointShared {
    /// Snapshot the middleware chain for one call or dispatch.
    pub(crate) fn middleware_chain(&self) -> MiddlewareChain {
        MiddlewareChain::snapshot(&self.middlewares.read())
    }
}

/// One side of an RPC session over a single transport.
///
/// Created with [`Endpoint::client`] or [`Endpoint::server`] - the role
/// only decides stream ID parity; both sides may register services and
/// originate calls.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    /// Create the client side of a session. The engine must be spawned
    /// by the caller.
    pub fn client<T: Transport>(transport: T, config: EndpointConfig) -> (Endpoint, Engine<T>) {
        Self::establish(transport, Role::Client, config)
    }

    /// Create the server side of a session.
    pub fn server<T: Transport>(transport: T, config: EndpointConfig) -> (Endpoint, Engine<T>) {
        Self::establish(transport, Role::Server, config)
    }

    fn establish<T: Transport>(
        transport: T,
        role: Role,
        config: EndpointConfig,
    ) -> (Endpoint, Engine<T>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let shared = Arc::new(EndpointShared {
            commands,
            registry: MethodRegistry::new(),
            middlewares: RwLock::new(Vec::new()),
            stream_ids: StreamIdAllocator::new(role),
            active: AtomicBool::new(true),
            stream_count: AtomicUsize::new(0),
            config,
            role,
        });
        let engine = Engine::new(transport, shared.clone(), command_rx);
        (Endpoint { shared }, engine)
    }

    /// Register a service contract. Duplicate registration is an error.
    pub fn register_service(&self, contract: ServiceContract) -> Result<(), RegistryError> {
        self.shared.registry.register_service(contract)
    }

    /// Append a middleware layer. Takes effect on subsequent calls
    /// only; in-flight calls keep the chain they snapshotted.
    pub fn add_middleware(&self, middleware: impl Middleware + 'static) {
        self.shared.middlewares.write().push(Arc::new(middleware));
    }

    /// Whether the endpoint is still serving.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Number of live logical streams.
    pub fn active_streams(&self) -> usize {
        self.shared.stream_count.load(Ordering::Relaxed)
    }

    /// Close the endpoint: cancel every open stream locally, close the
    /// transport, clear the registered contracts. Subsequent builder
    /// calls fail with `UNAVAILABLE`.
    pub async fn close(&self) {
        if self.shared.active.swap(false, Ordering::SeqCst) {
            let _ = self.shared.commands.send(EngineCommand::Shutdown).await;
            self.shared.registry.clear();
        }
    }

    /// Build a unary call: one request, one response.
    pub fn unary_request<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
    ) -> Result<UnaryRequest<Req, Resp>, CallError> {
        let timeout = self.prepare(service, method, MethodType::Unary)?;
        Ok(UnaryRequest::new(self.seed(
            service,
            method,
            request_codec,
            response_codec,
            timeout,
        )))
    }

    /// Build a server-streaming call: one request, a response sequence.
    pub fn server_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
    ) -> Result<ServerStreamRequest<Req, Resp>, CallError> {
        let timeout = self.prepare(service, method, MethodType::ServerStreaming)?;
        Ok(ServerStreamRequest::new(self.seed(
            service,
            method,
            request_codec,
            response_codec,
            timeout,
        )))
    }

    /// Build a client-streaming call: a request sequence, one response.
    pub fn client_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
    ) -> Result<ClientStreamRequest<Req, Resp>, CallError> {
        let timeout = self.prepare(service, method, MethodType::ClientStreaming)?;
        Ok(ClientStreamRequest::new(self.seed(
            service,
            method,
            request_codec,
            response_codec,
            timeout,
        )))
    }

    /// Build a bidirectional call: streams both ways.
    pub fn bidirectional_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
    ) -> Result<BidiRequest<Req, Resp>, CallError> {
        let timeout = self.prepare(service, method, MethodType::BidiStreaming)?;
        Ok(BidiRequest::new(self.seed(
            service,
            method,
            request_codec,
            response_codec,
            timeout,
        )))
    }

    /// Validate a builder against the local registry before anything
    /// touches the wire, and resolve the call's default deadline.
    ///
    /// A locally unregistered method is not an error here: the peer
    /// answers `UNIMPLEMENTED` if it does not know it either.
    fn prepare(
        &self,
        service: &str,
        method: &str,
        expected: MethodType,
    ) -> Result<Option<Duration>, CallError> {
        if !self.is_active() {
            return Err(CallError::unavailable("endpoint is closed"));
        }
        match self.shared.registry.lookup(service, method) {
            Some(contract) if contract.method_type() != expected => {
                Err(CallError::MethodTypeMismatch {
                    expected,
                    actual: contract.method_type(),
                })
            }
            Some(contract) => Ok(contract
                .options()
                .timeout
                .or(self.shared.config.default_timeout)),
            None => Ok(self.shared.config.default_timeout),
        }
    }

    fn seed<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Resp> + 'static,
        timeout: Option<Duration>,
    ) -> CallSeed<Req, Resp> {
        CallSeed {
            shared: self.shared.clone(),
            service: Arc::from(service),
            method: Arc::from(method),
            request_codec: Arc::new(request_codec),
            response_codec: Arc::new(response_codec),
            metadata: Vec::new(),
            timeout,
        }
    }
}
