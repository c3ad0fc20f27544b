//! Connection engine.
//!
//! The engine owns the transport. All outbound traffic funnels through
//! one bounded command queue - the transport has a single writer, and
//! per-stream FIFO falls out of queue order (a stream's `BEGIN` is
//! always written before its first `MESSAGE`). Inbound frames are
//! decoded and demultiplexed to per-stream event queues; a `BEGIN` for
//! an unknown stream resolves a contract and spawns one handler task.
//!
//! # Example
//!
//! ```ignore
//! let (endpoint, engine) = Endpoint::server(transport, EndpointConfig::default());
//! tokio::spawn(async move {
//!     let _ = engine.run().await;
//! });
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use futures_util::FutureExt as _;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use weft_wire::codec as wire;
use weft_wire::{Envelope, Metadata, MethodKey, Status, StatusCode, StreamId};

use crate::dispatch::ServerCall;
use crate::endpoint::EndpointShared;
use crate::streams::{StreamEvent, StreamState};
use crate::{CancelToken, EndpointEvent, EngineError, Transport};

/// Work submitted to the engine by call builders, stream handles, and
/// dispatch tasks. One queue for everything keeps the write side FIFO.
pub(crate) enum EngineCommand {
    /// Register a stream route and send `BEGIN`.
    Open {
        stream_id: StreamId,
        method: MethodKey,
        metadata: Metadata,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancelToken,
    },
    /// Send one `MESSAGE`.
    Send { stream_id: StreamId, payload: Bytes },
    /// Send `HALF_CLOSE` for the local direction.
    HalfClose { stream_id: StreamId },
    /// Cancel a stream: resolve it locally right away, tell the peer.
    Cancel { stream_id: StreamId },
    /// Send the terminal `STATUS` (callee side) and drop the stream.
    Terminal {
        stream_id: StreamId,
        status: Status,
        metadata: Metadata,
    },
    /// Stop the engine; open streams resolve with `CANCELLED`.
    Shutdown,
}

/// One live logical stream.
struct StreamSlot {
    events: mpsc::Sender<StreamEvent>,
    state: StreamState,
    cancel: CancelToken,
    /// Whether this side originated the stream. Decides whether an
    /// abort goes out as `CANCEL` (originator) or `STATUS` (callee).
    locally_originated: bool,
}

/// Why the drive loop stopped.
enum Exit {
    /// `Endpoint::close()` or every handle dropped.
    Shutdown,
    /// Peer closed the transport cleanly.
    PeerClosed,
    /// Transport or encoder failure.
    Failed(EngineError),
}

/// Owns the transport and drives all streams of one endpoint.
///
/// Returned by [`Endpoint::client`]/[`Endpoint::server`]; spawn
/// [`Engine::run`] to make the endpoint live.
///
/// [`Endpoint::client`]: crate::Endpoint::client
/// [`Endpoint::server`]: crate::Endpoint::server
pub struct Engine<T> {
    io: T,
    shared: Arc<EndpointShared>,
    commands: mpsc::Receiver<EngineCommand>,
    streams: HashMap<u64, StreamSlot>,
    events_sink: Option<mpsc::UnboundedSender<EndpointEvent>>,
}

impl<T: Transport> Engine<T> {
    pub(crate) fn new(
        io: T,
        shared: Arc<EndpointShared>,
        commands: mpsc::Receiver<EngineCommand>,
    ) -> Self {
        Self {
            io,
            shared,
            commands,
            streams: HashMap::new(),
            events_sink: None,
        }
    }

    /// Publish lifecycle events to `sink`. The engine only ever pushes;
    /// a diagnostics consumer that logs cannot recurse back into it.
    pub fn set_event_sink(&mut self, sink: mpsc::UnboundedSender<EndpointEvent>) {
        self.events_sink = Some(sink);
    }

    /// Run until the endpoint closes or the transport goes away.
    ///
    /// On shutdown, open streams resolve locally with `CANCELLED`; on
    /// transport loss they resolve with `UNAVAILABLE` and nothing more
    /// is sent.
    pub async fn run(mut self) -> Result<(), EngineError> {
        debug!(name = ?self.shared.config.name, role = ?self.shared.role, "engine running");
        let exit = self.drive().await;
        self.shared.active.store(false, Ordering::SeqCst);

        let status = match &exit {
            Exit::Shutdown => Status::cancelled("endpoint closed"),
            Exit::PeerClosed | Exit::Failed(_) => Status::unavailable("transport closed"),
        };
        self.resolve_all(status);
        let _ = self.io.close().await;
        self.emit(EndpointEvent::TransportClosed);

        match exit {
            Exit::Shutdown => {
                debug!("engine stopped: endpoint closed");
                Ok(())
            }
            Exit::PeerClosed => {
                debug!("engine stopped: peer closed transport");
                Ok(())
            }
            Exit::Failed(e) => {
                warn!(error = %e, "engine stopped on transport failure");
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Exit {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        None | Some(EngineCommand::Shutdown) => return Exit::Shutdown,
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                return Exit::Failed(e);
                            }
                        }
                    }
                }
                frame = self.io.recv() => {
                    match frame {
                        Ok(Some(frame)) => {
                            if let Err(e) = self.handle_frame(frame).await {
                                return Exit::Failed(e);
                            }
                        }
                        Ok(None) => return Exit::PeerClosed,
                        Err(e) => return Exit::Failed(EngineError::Io(e)),
                    }
                }
            }
        }
    }

    // ========================================================================
    // Outbound: commands from handles and dispatch tasks
    // ========================================================================

    async fn handle_command(&mut self, cmd: EngineCommand) -> Result<(), EngineError> {
        match cmd {
            EngineCommand::Open {
                stream_id,
                method,
                metadata,
                events,
                cancel,
            } => {
                trace!(%stream_id, %method, "opening outbound stream");
                self.streams.insert(
                    stream_id.raw(),
                    StreamSlot {
                        events,
                        state: StreamState::Open,
                        cancel,
                        locally_originated: true,
                    },
                );
                self.shared.stream_count.fetch_add(1, Ordering::Relaxed);
                self.emit(EndpointEvent::StreamOpened {
                    stream_id,
                    method: method.clone(),
                });
                self.send_envelope(Envelope::Begin {
                    stream_id,
                    method,
                    metadata,
                })
                .await
            }

            EngineCommand::Send { stream_id, payload } => {
                let sendable = self
                    .streams
                    .get(&stream_id.raw())
                    .is_some_and(|slot| slot.state.can_send());
                if !sendable {
                    // Stream already terminal or cancelled; late messages
                    // are dropped, not sent.
                    trace!(%stream_id, "dropping message for finished stream");
                    return Ok(());
                }
                if payload.len() as u64 > self.shared.config.max_payload_size as u64 {
                    error!(
                        %stream_id,
                        len = payload.len(),
                        max = self.shared.config.max_payload_size,
                        "outbound payload exceeds max_payload_size"
                    );
                    return self
                        .abort_stream(
                            stream_id,
                            Status::internal("outbound payload exceeds maximum size"),
                        )
                        .await;
                }
                self.send_envelope(Envelope::Message { stream_id, payload })
                    .await
            }

            EngineCommand::HalfClose { stream_id } => {
                let live = match self.streams.get_mut(&stream_id.raw()) {
                    Some(slot) => {
                        slot.state = slot.state.local_half_close();
                        true
                    }
                    None => false,
                };
                if live {
                    self.send_envelope(Envelope::HalfClose { stream_id }).await
                } else {
                    Ok(())
                }
            }

            EngineCommand::Cancel { stream_id } => {
                // The cancelling side resolves immediately; the peer
                // observes at its next suspension point.
                if let Some(slot) = self.streams.remove(&stream_id.raw()) {
                    slot.cancel.cancel();
                    deliver(&slot.events, StreamEvent::Cancelled);
                    self.stream_closed(stream_id, StatusCode::Cancelled);
                    self.send_envelope(Envelope::Cancel { stream_id }).await
                } else {
                    Ok(())
                }
            }

            EngineCommand::Terminal {
                stream_id,
                status,
                metadata,
            } => {
                // The slot is gone if the stream was cancelled or aborted
                // meanwhile; the terminal must not be sent then.
                if self.streams.remove(&stream_id.raw()).is_some() {
                    let code = status.code;
                    self.send_envelope(Envelope::Status {
                        stream_id,
                        status,
                        metadata,
                    })
                    .await?;
                    self.stream_closed(stream_id, code);
                }
                Ok(())
            }

            // Handled in drive().
            EngineCommand::Shutdown => Ok(()),
        }
    }

    // ========================================================================
    // Inbound: frames from the transport
    // ========================================================================

    async fn handle_frame(&mut self, frame: Bytes) -> Result<(), EngineError> {
        let envelope = match wire::decode_frame(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "dropping malformed frame");
                return Ok(());
            }
        };
        trace!(kind = ?envelope.kind(), stream_id = %envelope.stream_id(), "received envelope");

        match envelope {
            Envelope::Begin {
                stream_id,
                method,
                metadata,
            } => self.handle_begin(stream_id, method, metadata).await,

            Envelope::Message { stream_id, payload } => {
                self.handle_message(stream_id, payload).await
            }

            Envelope::HalfClose { stream_id } => {
                let events = match self.streams.get_mut(&stream_id.raw()) {
                    Some(slot) => {
                        slot.state = slot.state.remote_half_close();
                        Some(slot.events.clone())
                    }
                    None => {
                        trace!(%stream_id, "HALF_CLOSE for unknown stream, discarding");
                        None
                    }
                };
                if let Some(events) = events {
                    route(&events, StreamEvent::HalfClose).await;
                }
                Ok(())
            }

            Envelope::Status {
                stream_id,
                status,
                metadata,
            } => {
                // The first terminal observed wins; anything later on
                // this id is silently discarded.
                if let Some(slot) = self.streams.remove(&stream_id.raw()) {
                    let code = status.code;
                    slot.cancel.cancel();
                    deliver(&slot.events, StreamEvent::Terminal { status, metadata });
                    self.stream_closed(stream_id, code);
                } else {
                    trace!(%stream_id, "STATUS for unknown stream, discarding");
                }
                Ok(())
            }

            Envelope::Cancel { stream_id } => {
                if let Some(slot) = self.streams.remove(&stream_id.raw()) {
                    slot.cancel.cancel();
                    deliver(&slot.events, StreamEvent::Cancelled);
                    self.stream_closed(stream_id, StatusCode::Cancelled);
                } else {
                    trace!(%stream_id, "CANCEL for unknown stream, discarding");
                }
                Ok(())
            }
        }
    }

    async fn handle_begin(
        &mut self,
        stream_id: StreamId,
        method: MethodKey,
        metadata: Metadata,
    ) -> Result<(), EngineError> {
        if self.streams.contains_key(&stream_id.raw()) {
            warn!(%stream_id, "duplicate BEGIN for live stream, aborting");
            return self
                .abort_stream(stream_id, Status::internal("duplicate BEGIN"))
                .await;
        }
        if stream_id.originated_by() == self.shared.role {
            warn!(%stream_id, role = ?self.shared.role, "BEGIN with this endpoint's own id parity");
            return self
                .send_envelope(Envelope::Status {
                    stream_id,
                    status: Status::invalid_argument(
                        "stream id parity collides with this endpoint",
                    ),
                    metadata: Vec::new(),
                })
                .await;
        }

        let Some(contract) = self.shared.registry.lookup(&method.service, &method.method) else {
            debug!(%method, "BEGIN for unregistered method");
            return self
                .send_envelope(Envelope::Status {
                    stream_id,
                    status: Status::unimplemented(format!("{method} is not implemented")),
                    metadata: Vec::new(),
                })
                .await;
        };

        let (events_tx, events_rx) = mpsc::channel(self.shared.config.stream_buffer);
        let cancel = CancelToken::default();
        self.streams.insert(
            stream_id.raw(),
            StreamSlot {
                events: events_tx,
                state: StreamState::Open,
                cancel: cancel.clone(),
                locally_originated: false,
            },
        );
        self.shared.stream_count.fetch_add(1, Ordering::Relaxed);
        self.emit(EndpointEvent::StreamOpened {
            stream_id,
            method: method.clone(),
        });
        debug!(%stream_id, %method, "dispatching inbound call");

        let call = ServerCall {
            stream_id,
            service: Arc::from(contract.service()),
            method: Arc::from(contract.method()),
            metadata,
            events: events_rx,
            commands: self.shared.commands.clone(),
            chain: self.shared.middleware_chain(),
            cancel,
        };
        let invocation = contract.handler().invoke(call);
        let commands = self.shared.commands.clone();
        tokio::spawn(async move {
            // A panicking handler must still terminate its stream.
            if AssertUnwindSafe(invocation).catch_unwind().await.is_err() {
                error!(%stream_id, "handler panicked");
                let _ = commands
                    .send(EngineCommand::Terminal {
                        stream_id,
                        status: Status::internal("handler panicked"),
                        metadata: Vec::new(),
                    })
                    .await;
            }
        });
        Ok(())
    }

    async fn handle_message(
        &mut self,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<(), EngineError> {
        let (events, violation) = match self.streams.get(&stream_id.raw()) {
            Some(slot) => (slot.events.clone(), !slot.state.peer_may_send()),
            None => {
                trace!(%stream_id, "MESSAGE for unknown stream, discarding");
                return Ok(());
            }
        };
        if violation {
            warn!(%stream_id, "MESSAGE after HALF_CLOSE, aborting stream");
            return self
                .abort_stream(stream_id, Status::internal("message received after half-close"))
                .await;
        }
        route(&events, StreamEvent::Message(payload)).await;
        Ok(())
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    async fn send_envelope(&mut self, envelope: Envelope) -> Result<(), EngineError> {
        trace!(kind = ?envelope.kind(), stream_id = %envelope.stream_id(), "sending envelope");
        let frame = wire::encode_to_bytes(&envelope)?;
        self.io.send(frame).await?;
        Ok(())
    }

    /// Kill a stream on a protocol violation: resolve it locally, then
    /// notify the peer - `STATUS` when we are the callee, `CANCEL` when
    /// we originated it.
    async fn abort_stream(
        &mut self,
        stream_id: StreamId,
        status: Status,
    ) -> Result<(), EngineError> {
        let Some(slot) = self.streams.remove(&stream_id.raw()) else {
            return Ok(());
        };
        slot.cancel.cancel();
        let code = status.code;
        deliver(
            &slot.events,
            StreamEvent::Terminal {
                status: status.clone(),
                metadata: Vec::new(),
            },
        );
        if slot.locally_originated {
            self.send_envelope(Envelope::Cancel { stream_id }).await?;
        } else {
            self.send_envelope(Envelope::Status {
                stream_id,
                status,
                metadata: Vec::new(),
            })
            .await?;
        }
        self.stream_closed(stream_id, code);
        Ok(())
    }

    /// Resolve every open stream locally with `status`. Nothing is sent.
    fn resolve_all(&mut self, status: Status) {
        let drained: Vec<(u64, StreamSlot)> = self.streams.drain().collect();
        for (raw, slot) in drained {
            slot.cancel.cancel();
            deliver(
                &slot.events,
                StreamEvent::Terminal {
                    status: status.clone(),
                    metadata: Vec::new(),
                },
            );
            self.stream_closed(StreamId::new(raw), status.code);
        }
    }

    fn stream_closed(&mut self, stream_id: StreamId, code: StatusCode) {
        self.shared.stream_count.fetch_sub(1, Ordering::Relaxed);
        self.emit(EndpointEvent::StreamClosed { stream_id, code });
    }

    fn emit(&self, event: EndpointEvent) {
        if let Some(sink) = &self.events_sink {
            let _ = sink.send(event);
        }
    }
}

/// In-order delivery into a stream's event queue. Suspends when the
/// queue is full, so slow consumers backpressure the transport reader.
async fn route(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    // The consumer may already be gone (handler returned early); fine.
    let _ = events.send(event).await;
}

/// Deliver a terminal event without blocking the engine. The slot is
/// already removed, so the spawned send is the queue's last producer
/// and ordering is preserved.
fn deliver(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        let events = events.clone();
        tokio::spawn(async move {
            let _ = events.send(event).await;
        });
    }
}
