//! Server-side dispatch adapters.
//!
//! One adapter per call pattern. Each wraps a typed handler and its
//! codecs behind the type-erased [`RawHandler`] the registry stores,
//! enforcing the pattern's cardinality constraints on the shared stream
//! machinery: deserialize inbound messages, call the handler, serialize
//! what it produces, and finish with a terminal status.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use weft_wire::{Metadata, Status, StreamId};

use crate::engine::EngineCommand;
use crate::middleware::MiddlewareChain;
use crate::streams::{Inbound, Outbound, PayloadKind, RecvError, StreamEvent};
use crate::{CancelToken, Codec, RequestStream, Responder};

/// Context passed to service method handlers.
#[derive(Clone)]
pub struct CallContext {
    stream_id: StreamId,
    service: Arc<str>,
    method: Arc<str>,
    metadata: Metadata,
    cancel: CancelToken,
}

impl CallContext {
    /// The stream carrying this call.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Metadata sent on the `BEGIN` envelope.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether the caller has cancelled this call.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for cancellation; useful in `select!` around long waits.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Everything a handler invocation needs, routed from the engine.
pub(crate) struct ServerCall {
    pub(crate) stream_id: StreamId,
    pub(crate) service: Arc<str>,
    pub(crate) method: Arc<str>,
    pub(crate) metadata: Metadata,
    pub(crate) events: mpsc::Receiver<StreamEvent>,
    pub(crate) commands: mpsc::Sender<EngineCommand>,
    pub(crate) chain: MiddlewareChain,
    pub(crate) cancel: CancelToken,
}

/// Split a call into handler context, typed inbound sequence, and the
/// completion half shared by every adapter.
fn split_call<Req>(
    call: ServerCall,
    request_codec: Arc<dyn Codec<Req>>,
) -> (CallContext, Inbound<Req>, Finisher) {
    let ServerCall {
        stream_id,
        service,
        method,
        metadata,
        events,
        commands,
        chain,
        cancel,
    } = call;
    let cx = CallContext {
        stream_id,
        service: service.clone(),
        method: method.clone(),
        metadata,
        cancel: cancel.clone(),
    };
    let inbound = Inbound::new(
        events,
        request_codec,
        chain.clone(),
        PayloadKind::Request,
        service.clone(),
        method.clone(),
    );
    let finisher = Finisher {
        stream_id,
        service,
        method,
        commands,
        chain,
        cancel,
    };
    (cx, inbound, finisher)
}

/// The completion half of a server call: builds the outbound sink and
/// delivers the response message and terminal status.
struct Finisher {
    stream_id: StreamId,
    service: Arc<str>,
    method: Arc<str>,
    commands: mpsc::Sender<EngineCommand>,
    chain: MiddlewareChain,
    cancel: CancelToken,
}

impl Finisher {
    fn responder<Resp>(&self, codec: Arc<dyn Codec<Resp>>) -> Responder<Resp> {
        Responder {
            inner: Outbound::new(
                self.stream_id,
                self.commands.clone(),
                codec,
                self.chain.clone(),
                PayloadKind::Response,
                self.service.clone(),
                self.method.clone(),
                self.cancel.clone(),
            ),
        }
    }

    async fn send_terminal(&self, status: Status) {
        let _ = self
            .commands
            .send(EngineCommand::Terminal {
                stream_id: self.stream_id,
                status,
                metadata: Vec::new(),
            })
            .await;
    }

    /// Encode a response, intercept it, and send it followed by
    /// `STATUS(OK)`.
    async fn send_single_response<Resp>(&self, codec: &Arc<dyn Codec<Resp>>, response: &Resp) {
        let payload = match codec.encode(response) {
            Ok(payload) => payload,
            Err(e) => {
                self.send_terminal(Status::internal(format!("response encoding failed: {e}")))
                    .await;
                return;
            }
        };
        match self
            .chain
            .run_response(&self.service, &self.method, payload)
            .await
        {
            Ok(payload) => {
                let _ = self
                    .commands
                    .send(EngineCommand::Send {
                        stream_id: self.stream_id,
                        payload: Bytes::from(payload),
                    })
                    .await;
                self.send_terminal(Status::ok()).await;
            }
            Err(status) => self.send_terminal(status).await,
        }
    }

    /// Resolve a single-response invocation. No status is sent when the
    /// call was cancelled: the caller already resolved locally and the
    /// engine dropped the stream.
    async fn finish_single<Resp>(
        &self,
        codec: &Arc<dyn Codec<Resp>>,
        result: Result<Resp, Status>,
    ) {
        if self.cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(response) => self.send_single_response(codec, &response).await,
            Err(status) => self.send_terminal(status).await,
        }
    }

    /// Resolve a streaming invocation whose messages already went out
    /// through a [`Responder`].
    async fn finish_streaming(&self, result: Result<(), Status>) {
        if self.cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(()) => self.send_terminal(Status::ok()).await,
            Err(status) => self.send_terminal(status).await,
        }
    }
}

/// Type-erased handler invocation, stored by [`MethodContract`].
///
/// Returns a boxed `'static` future so the engine can spawn one task
/// per stream.
///
/// [`MethodContract`]: crate::MethodContract
pub(crate) trait RawHandler: Send + Sync {
    fn invoke(&self, call: ServerCall) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

/// Outcome of collecting the single request of a unary or
/// server-streaming call.
enum Intake<T> {
    Value(T),
    /// Respond with this status and stop.
    Fail(Status),
    /// Cancelled or connection gone; nothing to send.
    Abort,
}

/// Collect exactly one request message followed by the half-close.
async fn recv_exactly_one<T>(inbound: &mut Inbound<T>) -> Intake<T> {
    let first = match inbound.next().await {
        Ok(Some(value)) => value,
        Ok(None) => {
            return Intake::Fail(Status::invalid_argument(
                "expected a request message before half-close",
            ));
        }
        Err(e) => return intake_error(e),
    };
    match inbound.next().await {
        Ok(None) => Intake::Value(first),
        Ok(Some(_)) => Intake::Fail(Status::invalid_argument(
            "more than one request message on a single-request call",
        )),
        Err(e) => intake_error(e),
    }
}

fn intake_error<T>(e: RecvError) -> Intake<T> {
    match e {
        RecvError::Status(status) => Intake::Fail(status),
        RecvError::Decode(e) => Intake::Fail(Status::invalid_argument(format!(
            "malformed request payload: {e}"
        ))),
        RecvError::Cancelled | RecvError::Lost => Intake::Abort,
    }
}

// ============================================================================
// Unary
// ============================================================================

pub(crate) struct UnaryMethod<Req, Resp, F> {
    pub(crate) request_codec: Arc<dyn Codec<Req>>,
    pub(crate) response_codec: Arc<dyn Codec<Resp>>,
    pub(crate) handler: Arc<F>,
}

impl<Req, Resp, F, Fut> RawHandler for UnaryMethod<Req, Resp, F>
where
    Req: Send + 'static,
    Resp: Send + Sync + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    fn invoke(&self, call: ServerCall) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let response_codec = self.response_codec.clone();
        let handler = self.handler.clone();
        let (cx, mut inbound, finisher) = split_call(call, self.request_codec.clone());

        Box::pin(async move {
            let request = match recv_exactly_one(&mut inbound).await {
                Intake::Value(request) => request,
                Intake::Fail(status) => {
                    finisher.send_terminal(status).await;
                    return;
                }
                Intake::Abort => return,
            };

            let result = (*handler)(cx, request).await;
            finisher.finish_single(&response_codec, result).await;
        })
    }
}

// ============================================================================
// Server streaming
// ============================================================================

pub(crate) struct ServerStreamMethod<Req, Resp, F> {
    pub(crate) request_codec: Arc<dyn Codec<Req>>,
    pub(crate) response_codec: Arc<dyn Codec<Resp>>,
    pub(crate) handler: Arc<F>,
}

impl<Req, Resp, F, Fut> RawHandler for ServerStreamMethod<Req, Resp, F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(CallContext, Req, Responder<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn invoke(&self, call: ServerCall) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let response_codec = self.response_codec.clone();
        let handler = self.handler.clone();
        let (cx, mut inbound, finisher) = split_call(call, self.request_codec.clone());

        Box::pin(async move {
            let request = match recv_exactly_one(&mut inbound).await {
                Intake::Value(request) => request,
                Intake::Fail(status) => {
                    finisher.send_terminal(status).await;
                    return;
                }
                Intake::Abort => return,
            };

            let responder = finisher.responder(response_codec);
            let result = (*handler)(cx, request, responder).await;
            finisher.finish_streaming(result).await;
        })
    }
}

// ============================================================================
// Client streaming
// ============================================================================

pub(crate) struct ClientStreamMethod<Req, Resp, F> {
    pub(crate) request_codec: Arc<dyn Codec<Req>>,
    pub(crate) response_codec: Arc<dyn Codec<Resp>>,
    pub(crate) handler: Arc<F>,
}

impl<Req, Resp, F, Fut> RawHandler for ClientStreamMethod<Req, Resp, F>
where
    Req: Send + 'static,
    Resp: Send + Sync + 'static,
    F: Fn(CallContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    fn invoke(&self, call: ServerCall) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let response_codec = self.response_codec.clone();
        let handler = self.handler.clone();
        let (cx, inbound, finisher) = split_call(call, self.request_codec.clone());

        Box::pin(async move {
            let requests = RequestStream { inner: inbound };
            let result = (*handler)(cx, requests).await;
            finisher.finish_single(&response_codec, result).await;
        })
    }
}

// ============================================================================
// Bidirectional streaming
// ============================================================================

pub(crate) struct BidiStreamMethod<Req, Resp, F> {
    pub(crate) request_codec: Arc<dyn Codec<Req>>,
    pub(crate) response_codec: Arc<dyn Codec<Resp>>,
    pub(crate) handler: Arc<F>,
}

impl<Req, Resp, F, Fut> RawHandler for BidiStreamMethod<Req, Resp, F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(CallContext, RequestStream<Req>, Responder<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn invoke(&self, call: ServerCall) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let response_codec = self.response_codec.clone();
        let handler = self.handler.clone();
        let (cx, inbound, finisher) = split_call(call, self.request_codec.clone());

        Box::pin(async move {
            let responder = finisher.responder(response_codec);
            let requests = RequestStream { inner: inbound };
            let result = (*handler)(cx, requests, responder).await;
            finisher.finish_streaming(result).await;
        })
    }
}
