//! Stream machinery shared by all four call patterns.
//!
//! A handler is uniformly a function from an inbound message sequence to
//! an outbound message sequence; each pattern constrains cardinality,
//! not the construct. [`Inbound`] and [`Outbound`] are the typed halves
//! of that uniform shape; [`RequestStream`] and [`Responder`] are the
//! server-facing wrappers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use weft_wire::{Metadata, Status, StreamId};

use crate::engine::EngineCommand;
use crate::middleware::MiddlewareChain;
use crate::{Codec, CodecError, SendError};

/// Shared lifecycle states. Transitions depend on each pattern's
/// cardinality constraints, but the lattice is common:
/// `Open -> HalfClosedLocal | HalfClosedRemote -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// This side will send no more messages.
    pub fn local_half_close(self) -> StreamState {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    /// The peer will send no more messages.
    pub fn remote_half_close(self) -> StreamState {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }

    /// Whether this side may still send messages.
    pub fn can_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Whether the peer may still send messages.
    pub fn peer_may_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }
}

/// Cooperative cancellation marker shared between the engine, the
/// handler context, and the stream halves.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Whether the stream has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Wait until the stream is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

/// Event routed by the engine into a stream's inbound queue.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// One decoded-later payload message.
    Message(Bytes),
    /// The peer half-closed its direction.
    HalfClose,
    /// Terminal status, from the peer or synthesized locally.
    Terminal { status: Status, metadata: Metadata },
    /// The stream was cancelled (by the peer, or locally on close).
    Cancelled,
}

/// Whether a payload travels the request or the response direction,
/// which decides the middleware hook applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadKind {
    Request,
    Response,
}

/// Error surfaced by [`Inbound::next`].
#[derive(Debug)]
pub(crate) enum RecvError {
    /// Non-OK terminal status, or a middleware veto.
    Status(Status),
    /// The stream was cancelled.
    Cancelled,
    /// The payload did not decode.
    Decode(CodecError),
    /// The engine dropped the queue without a terminal event.
    Lost,
}

/// How an inbound sequence ended; replayed on later polls.
#[derive(Debug, Clone)]
enum Ended {
    /// Half-close or `STATUS(OK)`.
    Complete,
    Status(Status),
    Cancelled,
    Lost,
}

/// Typed inbound message sequence over a stream's event queue.
pub(crate) struct Inbound<T> {
    events: mpsc::Receiver<StreamEvent>,
    codec: Arc<dyn Codec<T>>,
    chain: MiddlewareChain,
    kind: PayloadKind,
    service: Arc<str>,
    method: Arc<str>,
    ended: Option<Ended>,
    trailing_metadata: Metadata,
}

impl<T> Inbound<T> {
    pub(crate) fn new(
        events: mpsc::Receiver<StreamEvent>,
        codec: Arc<dyn Codec<T>>,
        chain: MiddlewareChain,
        kind: PayloadKind,
        service: Arc<str>,
        method: Arc<str>,
    ) -> Self {
        Self {
            events,
            codec,
            chain,
            kind,
            service,
            method,
            ended: None,
            trailing_metadata: Vec::new(),
        }
    }

    /// Next message, or `Ok(None)` once the sequence ended normally
    /// (peer half-close or `STATUS(OK)`). The terminal outcome is
    /// sticky: repeated polls after the end return the same result.
    pub(crate) async fn next(&mut self) -> Result<Option<T>, RecvError> {
        if let Some(ended) = &self.ended {
            return match ended {
                Ended::Complete => Ok(None),
                Ended::Status(status) => Err(RecvError::Status(status.clone())),
                Ended::Cancelled => Err(RecvError::Cancelled),
                Ended::Lost => Err(RecvError::Lost),
            };
        }

        match self.events.recv().await {
            Some(StreamEvent::Message(payload)) => {
                let payload = match self.kind {
                    PayloadKind::Request => {
                        self.chain
                            .run_request(&self.service, &self.method, payload.to_vec())
                            .await
                    }
                    PayloadKind::Response => {
                        self.chain
                            .run_response(&self.service, &self.method, payload.to_vec())
                            .await
                    }
                }
                .map_err(RecvError::Status)?;
                let value = self.codec.decode(&payload).map_err(RecvError::Decode)?;
                Ok(Some(value))
            }
            Some(StreamEvent::HalfClose) => {
                self.ended = Some(Ended::Complete);
                Ok(None)
            }
            Some(StreamEvent::Terminal { status, metadata }) => {
                self.trailing_metadata = metadata;
                if status.is_ok() {
                    self.ended = Some(Ended::Complete);
                    Ok(None)
                } else {
                    self.ended = Some(Ended::Status(status.clone()));
                    Err(RecvError::Status(status))
                }
            }
            Some(StreamEvent::Cancelled) => {
                self.ended = Some(Ended::Cancelled);
                Err(RecvError::Cancelled)
            }
            None => {
                self.ended = Some(Ended::Lost);
                Err(RecvError::Lost)
            }
        }
    }

    /// Metadata carried on the terminal `STATUS`, if one was observed.
    pub(crate) fn trailing_metadata(&self) -> &Metadata {
        &self.trailing_metadata
    }
}

/// Typed outbound sink over the engine's command queue.
pub(crate) struct Outbound<T> {
    stream_id: StreamId,
    commands: mpsc::Sender<EngineCommand>,
    codec: Arc<dyn Codec<T>>,
    chain: MiddlewareChain,
    kind: PayloadKind,
    service: Arc<str>,
    method: Arc<str>,
    cancel: CancelToken,
    half_closed: bool,
}

impl<T> Outbound<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream_id: StreamId,
        commands: mpsc::Sender<EngineCommand>,
        codec: Arc<dyn Codec<T>>,
        chain: MiddlewareChain,
        kind: PayloadKind,
        service: Arc<str>,
        method: Arc<str>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            stream_id,
            commands,
            codec,
            chain,
            kind,
            service,
            method,
            cancel,
            half_closed: false,
        }
    }

    /// Encode, intercept, and enqueue one message. Suspends when the
    /// engine's queue is full; aborts promptly on cancellation.
    pub(crate) async fn send(&mut self, value: &T) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        if self.half_closed {
            return Err(SendError::HalfClosed);
        }

        let payload = self.codec.encode(value)?;
        let payload = match self.kind {
            PayloadKind::Request => {
                self.chain
                    .run_request(&self.service, &self.method, payload)
                    .await
            }
            PayloadKind::Response => {
                self.chain
                    .run_response(&self.service, &self.method, payload)
                    .await
            }
        }
        .map_err(SendError::Rejected)?;

        let command = EngineCommand::Send {
            stream_id: self.stream_id,
            payload: payload.into(),
        };
        tokio::select! {
            sent = self.commands.send(command) => sent.map_err(|_| SendError::EngineGone),
            _ = self.cancel.cancelled() => Err(SendError::Cancelled),
        }
    }

    /// Signal that this side will send no more messages.
    pub(crate) async fn half_close(&mut self) -> Result<(), SendError> {
        if self.half_closed {
            return Ok(());
        }
        self.half_closed = true;
        self.commands
            .send(EngineCommand::HalfClose {
                stream_id: self.stream_id,
            })
            .await
            .map_err(|_| SendError::EngineGone)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Inbound request sequence handed to streaming handlers.
///
/// `Ok(None)` marks the client's half-close; a client-streaming handler
/// that sees it immediately (zero messages) is still expected to
/// produce its response.
pub struct RequestStream<T> {
    pub(crate) inner: Inbound<T>,
}

impl<T> RequestStream<T> {
    /// Next request, or `Ok(None)` after the client half-closes.
    pub async fn next(&mut self) -> Result<Option<T>, Status> {
        match self.inner.next().await {
            Ok(value) => Ok(value),
            Err(RecvError::Status(status)) => Err(status),
            Err(RecvError::Cancelled) => Err(Status::cancelled("call cancelled by peer")),
            Err(RecvError::Decode(e)) => Err(Status::invalid_argument(format!(
                "malformed request payload: {e}"
            ))),
            Err(RecvError::Lost) => Err(Status::unavailable("connection lost")),
        }
    }
}

/// Outbound response sink handed to streaming handlers.
///
/// `send` suspends while the transport is unwilling to accept more, so
/// response production is pull-driven and backpressure composes. After
/// the peer cancels, `send` fails with `CANCELLED`; that failure is the
/// handler's cancellation observation point.
pub struct Responder<T> {
    pub(crate) inner: Outbound<T>,
}

impl<T> Responder<T> {
    /// Send one response message.
    pub async fn send(&mut self, value: &T) -> Result<(), Status> {
        self.inner.send(value).await.map_err(SendError::into_status)
    }

    /// Whether the call has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}
