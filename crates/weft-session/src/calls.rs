//! Client-side call builders and stream handles.
//!
//! Each builder is keyed by `(service, method)` and validated against
//! the local registry at construction. Deadlines come from the method's
//! declared timeout (or a per-call override); when one expires the
//! originator emits `CANCEL` and the call resolves with
//! `DEADLINE_EXCEEDED`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use weft_wire::{Metadata, MethodKey, Status, StreamId};

use crate::endpoint::EndpointShared;
use crate::engine::EngineCommand;
use crate::streams::{Inbound, Outbound, PayloadKind, RecvError};
use crate::{CallError, CancelToken, Codec, SendError};

fn map_recv_error(e: RecvError) -> CallError {
    match e {
        RecvError::Status(status) => CallError::Status(status),
        RecvError::Cancelled => CallError::Status(Status::cancelled("call cancelled")),
        RecvError::Decode(e) => CallError::Codec(e),
        RecvError::Lost => CallError::EngineGone,
    }
}

/// Await the single response of a unary-response exchange: one message,
/// then the terminal status.
async fn recv_single_response<T>(inbound: &mut Inbound<T>) -> Result<T, CallError> {
    match inbound.next().await {
        Ok(Some(response)) => match inbound.next().await {
            Ok(None) => Ok(response),
            Ok(Some(_)) => Err(CallError::Status(Status::internal(
                "more than one response message on a single-response call",
            ))),
            Err(e) => Err(map_recv_error(e)),
        },
        Ok(None) => Err(CallError::Status(Status::internal(
            "call ended without a response message",
        ))),
        Err(e) => Err(map_recv_error(e)),
    }
}

/// Everything a call needs, captured at builder construction.
pub(crate) struct CallSeed<Req, Resp> {
    pub(crate) shared: Arc<EndpointShared>,
    pub(crate) service: Arc<str>,
    pub(crate) method: Arc<str>,
    pub(crate) request_codec: Arc<dyn Codec<Req>>,
    pub(crate) response_codec: Arc<dyn Codec<Resp>>,
    pub(crate) metadata: Metadata,
    pub(crate) timeout: Option<Duration>,
}

/// A freshly opened stream: `BEGIN` is queued, nothing else yet.
struct OpenCall<Req, Resp> {
    stream_id: StreamId,
    commands: mpsc::Sender<EngineCommand>,
    inbound: Inbound<Resp>,
    outbound: Outbound<Req>,
    deadline: Option<Instant>,
}

impl<Req, Resp> CallSeed<Req, Resp> {
    /// Encode and intercept one request payload. Local failures surface
    /// here, before anything touches the wire.
    async fn prepare_request(&self, request: &Req) -> Result<Bytes, CallError> {
        let payload = self.request_codec.encode(request)?;
        let payload = self
            .shared
            .middleware_chain()
            .run_request(&self.service, &self.method, payload)
            .await
            .map_err(CallError::Status)?;
        Ok(Bytes::from(payload))
    }

    /// Allocate a stream ID, register the route, and queue `BEGIN`.
    async fn open(&self) -> Result<OpenCall<Req, Resp>, CallError> {
        if !self.shared.active.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CallError::unavailable("endpoint is closed"));
        }
        let stream_id = self.shared.stream_ids.next();
        let (events_tx, events_rx) = mpsc::channel(self.shared.config.stream_buffer);
        let cancel = CancelToken::default();
        let chain = self.shared.middleware_chain();

        self.shared
            .commands
            .send(EngineCommand::Open {
                stream_id,
                method: MethodKey::new(self.service.as_ref(), self.method.as_ref()),
                metadata: self.metadata.clone(),
                events: events_tx,
                cancel: cancel.clone(),
            })
            .await
            .map_err(|_| CallError::EngineGone)?;

        Ok(OpenCall {
            stream_id,
            commands: self.shared.commands.clone(),
            inbound: Inbound::new(
                events_rx,
                self.response_codec.clone(),
                chain.clone(),
                PayloadKind::Response,
                self.service.clone(),
                self.method.clone(),
            ),
            outbound: Outbound::new(
                stream_id,
                self.shared.commands.clone(),
                self.request_codec.clone(),
                chain,
                PayloadKind::Request,
                self.service.clone(),
                self.method.clone(),
                cancel,
            ),
            deadline: self.timeout.map(|t| Instant::now() + t),
        })
    }
}

// ============================================================================
// Unary
// ============================================================================

/// Builder for a unary call.
pub struct UnaryRequest<Req, Resp> {
    seed: CallSeed<Req, Resp>,
}

impl<Req, Resp> std::fmt::Debug for UnaryRequest<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryRequest").finish_non_exhaustive()
    }
}

impl<Req, Resp> UnaryRequest<Req, Resp> {
    pub(crate) fn new(seed: CallSeed<Req, Resp>) -> Self {
        Self { seed }
    }

    /// Metadata to carry on the `BEGIN` envelope.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.seed.metadata = metadata;
        self
    }

    /// Override the method's declared timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.seed.timeout = Some(timeout);
        self
    }

    /// Make the call: send the request, await exactly one response and
    /// the terminal status.
    pub async fn call(&self, request: &Req) -> Result<Resp, CallError> {
        let payload = self.seed.prepare_request(request).await?;
        let mut call = self.seed.open().await?;
        let stream_id = call.stream_id;
        let commands = call.commands.clone();

        let exchange = async {
            commands
                .send(EngineCommand::Send { stream_id, payload })
                .await
                .map_err(|_| CallError::EngineGone)?;
            commands
                .send(EngineCommand::HalfClose { stream_id })
                .await
                .map_err(|_| CallError::EngineGone)?;
            recv_single_response(&mut call.inbound).await
        };

        match call.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = call
                        .commands
                        .send(EngineCommand::Cancel { stream_id })
                        .await;
                    Err(CallError::Status(Status::deadline_exceeded(
                        "call deadline exceeded",
                    )))
                }
            },
            None => exchange.await,
        }
    }
}

// ============================================================================
// Server streaming
// ============================================================================

/// Builder for a server-streaming call.
pub struct ServerStreamRequest<Req, Resp> {
    seed: CallSeed<Req, Resp>,
}

impl<Req, Resp> std::fmt::Debug for ServerStreamRequest<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStreamRequest").finish_non_exhaustive()
    }
}

impl<Req, Resp> ServerStreamRequest<Req, Resp> {
    pub(crate) fn new(seed: CallSeed<Req, Resp>) -> Self {
        Self { seed }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.seed.metadata = metadata;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.seed.timeout = Some(timeout);
        self
    }

    /// Send the request and return the response sequence.
    pub async fn call(&self, request: &Req) -> Result<ResponseStream<Resp>, CallError> {
        let payload = self.seed.prepare_request(request).await?;
        let call = self.seed.open().await?;
        let stream_id = call.stream_id;

        call.commands
            .send(EngineCommand::Send { stream_id, payload })
            .await
            .map_err(|_| CallError::EngineGone)?;
        call.commands
            .send(EngineCommand::HalfClose { stream_id })
            .await
            .map_err(|_| CallError::EngineGone)?;

        Ok(ResponseStream {
            inbound: call.inbound,
            stream_id,
            commands: call.commands,
            deadline: call.deadline,
            cancelled: false,
        })
    }
}

// ============================================================================
// Client streaming
// ============================================================================

/// Builder for a client-streaming call.
pub struct ClientStreamRequest<Req, Resp> {
    seed: CallSeed<Req, Resp>,
}

impl<Req, Resp> std::fmt::Debug for ClientStreamRequest<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStreamRequest").finish_non_exhaustive()
    }
}

impl<Req, Resp> ClientStreamRequest<Req, Resp> {
    pub(crate) fn new(seed: CallSeed<Req, Resp>) -> Self {
        Self { seed }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.seed.metadata = metadata;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.seed.timeout = Some(timeout);
        self
    }

    /// Open the stream and return the request sink plus the pending
    /// response.
    pub async fn open(&self) -> Result<(RequestSink<Req>, PendingResponse<Resp>), CallError> {
        let call = self.seed.open().await?;
        Ok((
            RequestSink {
                outbound: call.outbound,
                commands: call.commands.clone(),
                stream_id: call.stream_id,
            },
            PendingResponse {
                inbound: call.inbound,
                stream_id: call.stream_id,
                commands: call.commands,
                deadline: call.deadline,
            },
        ))
    }

    /// Send every request, half-close, and await the single response.
    pub async fn call<I>(&self, requests: I) -> Result<Resp, CallError>
    where
        I: IntoIterator<Item = Req>,
    {
        let (mut sink, response) = self.open().await?;
        for request in requests {
            if let Err(e) = sink.send(&request).await {
                sink.cancel().await;
                return Err(e);
            }
        }
        sink.half_close().await?;
        response.recv().await
    }
}

// ============================================================================
// Bidirectional streaming
// ============================================================================

/// Builder for a bidirectional-streaming call.
pub struct BidiRequest<Req, Resp> {
    seed: CallSeed<Req, Resp>,
}

impl<Req, Resp> std::fmt::Debug for BidiRequest<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidiRequest").finish_non_exhaustive()
    }
}

impl<Req, Resp> BidiRequest<Req, Resp> {
    pub(crate) fn new(seed: CallSeed<Req, Resp>) -> Self {
        Self { seed }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.seed.metadata = metadata;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.seed.timeout = Some(timeout);
        self
    }

    /// Open the stream and return both halves. Messages interleave
    /// freely until each side half-closes.
    pub async fn open(&self) -> Result<(RequestSink<Req>, ResponseStream<Resp>), CallError> {
        let call = self.seed.open().await?;
        Ok((
            RequestSink {
                outbound: call.outbound,
                commands: call.commands.clone(),
                stream_id: call.stream_id,
            },
            ResponseStream {
                inbound: call.inbound,
                stream_id: call.stream_id,
                commands: call.commands,
                deadline: call.deadline,
                cancelled: false,
            },
        ))
    }

    /// Feed a fixed request sequence from a background task and return
    /// the response sequence.
    pub async fn call<I>(&self, requests: I) -> Result<ResponseStream<Resp>, CallError>
    where
        Req: Send + Sync + 'static,
        I: IntoIterator<Item = Req> + Send + 'static,
        I::IntoIter: Send,
    {
        let (mut sink, stream) = self.open().await?;
        tokio::spawn(async move {
            for request in requests {
                if sink.send(&request).await.is_err() {
                    sink.cancel().await;
                    return;
                }
            }
            let _ = sink.half_close().await;
        });
        Ok(stream)
    }
}

// ============================================================================
// Client stream handles
// ============================================================================

/// Outbound request sink of a client-streaming or bidirectional call.
pub struct RequestSink<T> {
    outbound: Outbound<T>,
    commands: mpsc::Sender<EngineCommand>,
    stream_id: StreamId,
}

impl<T> RequestSink<T> {
    /// Send one request message.
    pub async fn send(&mut self, value: &T) -> Result<(), CallError> {
        self.outbound
            .send(value)
            .await
            .map_err(SendError::into_call_error)
    }

    /// Signal that no more requests follow.
    pub async fn half_close(&mut self) -> Result<(), CallError> {
        self.outbound
            .half_close()
            .await
            .map_err(SendError::into_call_error)
    }

    /// Cancel the call. The local side resolves immediately.
    pub async fn cancel(&mut self) {
        let _ = self
            .commands
            .send(EngineCommand::Cancel {
                stream_id: self.stream_id,
            })
            .await;
    }
}

/// Response sequence of a server-streaming or bidirectional call.
///
/// The terminal status is exposed through `next`: `Ok(None)` is a
/// normal `STATUS(OK)` end, an error status surfaces as
/// [`CallError::Status`].
pub struct ResponseStream<T> {
    inbound: Inbound<T>,
    stream_id: StreamId,
    commands: mpsc::Sender<EngineCommand>,
    deadline: Option<Instant>,
    cancelled: bool,
}

impl<T> ResponseStream<T> {
    /// Next response message, or `Ok(None)` on a normal end.
    pub async fn next(&mut self) -> Result<Option<T>, CallError> {
        if self.cancelled {
            return Err(CallError::Status(Status::cancelled("call cancelled")));
        }
        let result = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.inbound.next()).await {
                Ok(result) => result,
                Err(_) => {
                    self.cancelled = true;
                    let _ = self
                        .commands
                        .send(EngineCommand::Cancel {
                            stream_id: self.stream_id,
                        })
                        .await;
                    return Err(CallError::Status(Status::deadline_exceeded(
                        "call deadline exceeded",
                    )));
                }
            },
            None => self.inbound.next().await,
        };
        result.map_err(map_recv_error)
    }

    /// Cancel the call. Resolves locally right away; the server
    /// observes at its next suspension point.
    pub async fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            let _ = self
                .commands
                .send(EngineCommand::Cancel {
                    stream_id: self.stream_id,
                })
                .await;
        }
    }

    /// Metadata from the terminal `STATUS`, once observed.
    pub fn trailing_metadata(&self) -> &Metadata {
        self.inbound.trailing_metadata()
    }
}

/// The pending single response of a client-streaming call.
pub struct PendingResponse<T> {
    inbound: Inbound<T>,
    stream_id: StreamId,
    commands: mpsc::Sender<EngineCommand>,
    deadline: Option<Instant>,
}

impl<T> PendingResponse<T> {
    /// Await the response and terminal status.
    pub async fn recv(mut self) -> Result<T, CallError> {
        let commands = self.commands.clone();
        let stream_id = self.stream_id;
        let wait = recv_single_response(&mut self.inbound);

        match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, wait).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = commands.send(EngineCommand::Cancel { stream_id }).await;
                    Err(CallError::Status(Status::deadline_exceeded(
                        "call deadline exceeded",
                    )))
                }
            },
            None => wait.await,
        }
    }
}
