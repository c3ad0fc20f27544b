//! Unary call semantics over an in-memory transport pair:
//! success, error surfacing, unimplemented methods, builder validation,
//! deadlines, metadata, middleware, and endpoint shutdown.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use common::{endpoint_pair, settle};
use facet::Facet;
use parking_lot::Mutex;
use weft_session::{
    CallContext, CallError, EndpointEvent, JsonCodec, Middleware, MiddlewareFuture, PostcardCodec,
    ServiceContract, Status, StatusCode,
};

#[derive(Debug, Clone, PartialEq, Facet)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Clone, PartialEq, Facet)]
struct AddResponse {
    sum: i64,
}

fn calc_service() -> ServiceContract {
    ServiceContract::define("Calc", |svc| {
        svc.unary(
            "add",
            PostcardCodec::new(),
            PostcardCodec::new(),
            |_cx, req: AddRequest| async move { Ok(AddResponse { sum: req.a + req.b }) },
        );
        svc.unary(
            "div",
            PostcardCodec::new(),
            PostcardCodec::new(),
            |_cx, req: AddRequest| async move {
                if req.b == 0 {
                    return Err(Status::invalid_argument("division by zero"));
                }
                Ok(AddResponse { sum: req.a / req.b })
            },
        );
    })
}

#[tokio::test]
async fn unary_success() {
    let (client, server) = endpoint_pair();
    server.register_service(calc_service()).unwrap();

    let add = client
        .unary_request(
            "Calc",
            "add",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap();
    let response = add.call(&AddRequest { a: 2, b: 3 }).await.unwrap();
    assert_eq!(response, AddResponse { sum: 5 });

    settle().await;
    assert_eq!(client.active_streams(), 0);
    assert_eq!(server.active_streams(), 0);
}

#[tokio::test]
async fn unary_handler_error_surfaces_as_status() {
    let (client, server) = endpoint_pair();
    server.register_service(calc_service()).unwrap();

    let div = client
        .unary_request(
            "Calc",
            "div",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap();
    let err = div.call(&AddRequest { a: 1, b: 0 }).await.unwrap_err();

    match err {
        CallError::Status(status) => {
            assert_eq!(status.code, StatusCode::InvalidArgument);
            assert_eq!(status.message, "division by zero");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn unimplemented_method_gets_status_without_a_stream() {
    let (client, server) = endpoint_pair();
    server.register_service(calc_service()).unwrap();

    let call = client
        .unary_request(
            "Unknown",
            "method",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap();
    let err = call.call(&AddRequest { a: 1, b: 1 }).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::Unimplemented);

    settle().await;
    // The server never created a logical stream for it.
    assert_eq!(server.active_streams(), 0);
}

#[tokio::test]
async fn builder_kind_must_match_registered_method_type() {
    let (client, server) = endpoint_pair();
    // Contracts are definitions; both sides may hold them.
    client.register_service(calc_service()).unwrap();
    server.register_service(calc_service()).unwrap();

    let err = client
        .server_stream(
            "Calc",
            "add",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap_err();
    assert!(matches!(err, CallError::MethodTypeMismatch { .. }));
    assert_eq!(err.code(), StatusCode::InvalidArgument);
}

#[tokio::test]
async fn duplicate_registration_is_an_error() {
    let (_client, server) = endpoint_pair();
    server.register_service(calc_service()).unwrap();
    assert!(server.register_service(calc_service()).is_err());
}

#[tokio::test]
async fn close_fails_subsequent_builders_with_unavailable() {
    let (client, server) = endpoint_pair();
    server.register_service(calc_service()).unwrap();
    client.close().await;

    let err = client
        .unary_request(
            "Calc",
            "add",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Unavailable);
    assert!(!client.is_active());
}

#[tokio::test]
async fn engine_loss_makes_builders_unavailable() {
    let (client_io, server_io) = memory_only_client();
    drop(server_io);
    let (client, engine) = weft_session::Endpoint::client(
        client_io,
        weft_session::EndpointConfig::default(),
    );
    tokio::spawn(async move {
        let _ = engine.run().await;
    });

    settle().await;
    let err = client
        .unary_request(
            "Calc",
            "add",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Unavailable);
}

fn memory_only_client() -> (weft_memory::MemoryTransport, weft_memory::MemoryTransport) {
    weft_memory::memory_transport_pair(8)
}

fn slow_service(observed_cancel: Arc<AtomicBool>) -> ServiceContract {
    ServiceContract::define("Slow", |svc| {
        svc.unary(
            "wait",
            PostcardCodec::new(),
            PostcardCodec::new(),
            move |cx: CallContext, _req: u32| {
                let observed_cancel = observed_cancel.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    observed_cancel.store(cx.is_cancelled(), Ordering::SeqCst);
                    Ok::<u32, Status>(0)
                }
            },
        )
        .timeout(Duration::from_millis(100));
    })
}

#[tokio::test]
async fn declared_deadline_cancels_the_call() {
    let (client, server) = endpoint_pair();
    let observed_cancel = Arc::new(AtomicBool::new(false));
    // The contract is a shared definition: the client registers it too,
    // which is where the declared timeout is picked up.
    client
        .register_service(slow_service(observed_cancel.clone()))
        .unwrap();
    server
        .register_service(slow_service(observed_cancel.clone()))
        .unwrap();

    let wait = client
        .unary_request(
            "Slow",
            "wait",
            PostcardCodec::<u32>::new(),
            PostcardCodec::<u32>::new(),
        )
        .unwrap();

    let started = Instant::now();
    let err = wait.call(&0).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.code(), StatusCode::DeadlineExceeded);
    assert!(elapsed >= Duration::from_millis(90), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");

    // The handler keeps running until its sleep ends, then sees the
    // cancellation the deadline propagated.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(observed_cancel.load(Ordering::SeqCst));
}

#[tokio::test]
async fn per_call_timeout_overrides_declared_one() {
    let (client, server) = endpoint_pair();
    let observed_cancel = Arc::new(AtomicBool::new(false));
    server
        .register_service(slow_service(observed_cancel))
        .unwrap();

    let wait = client
        .unary_request(
            "Slow",
            "wait",
            PostcardCodec::<u32>::new(),
            PostcardCodec::<u32>::new(),
        )
        .unwrap()
        .with_timeout(Duration::from_millis(30));

    let started = Instant::now();
    let err = wait.call(&0).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn begin_metadata_reaches_the_handler() {
    let (client, server) = endpoint_pair();
    server
        .register_service(ServiceContract::define("Meta", |svc| {
            svc.unary(
                "echo_trace",
                PostcardCodec::new(),
                PostcardCodec::new(),
                |cx: CallContext, _req: u32| async move {
                    let trace = cx
                        .metadata()
                        .iter()
                        .find(|(key, _)| key == "trace-id")
                        .map(|(_, value)| value.clone())
                        .unwrap_or_default();
                    Ok::<String, Status>(trace)
                },
            );
        }))
        .unwrap();

    let call = client
        .unary_request(
            "Meta",
            "echo_trace",
            PostcardCodec::<u32>::new(),
            PostcardCodec::<String>::new(),
        )
        .unwrap()
        .with_metadata(vec![("trace-id".into(), "abc123".into())]);

    assert_eq!(call.call(&0).await.unwrap(), "abc123");
}

struct Tag {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Middleware for Tag {
    fn process_request<'a>(
        &'a self,
        _service: &'a str,
        _method: &'a str,
        request: Vec<u8>,
    ) -> MiddlewareFuture<'a> {
        Box::pin(async move {
            self.log.lock().push(format!("{}:req", self.name));
            Ok(request)
        })
    }

    fn process_response<'a>(
        &'a self,
        _service: &'a str,
        _method: &'a str,
        response: Vec<u8>,
    ) -> MiddlewareFuture<'a> {
        Box::pin(async move {
            self.log.lock().push(format!("{}:resp", self.name));
            Ok(response)
        })
    }
}

#[tokio::test]
async fn middleware_wraps_in_registration_order() {
    let (client, server) = endpoint_pair();
    server.register_service(calc_service()).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    server.add_middleware(Tag {
        name: "outer",
        log: log.clone(),
    });
    server.add_middleware(Tag {
        name: "inner",
        log: log.clone(),
    });

    let add = client
        .unary_request(
            "Calc",
            "add",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap();
    let response = add.call(&AddRequest { a: 4, b: 4 }).await.unwrap();
    assert_eq!(response.sum, 8);

    assert_eq!(
        *log.lock(),
        vec!["outer:req", "inner:req", "inner:resp", "outer:resp"]
    );
}

struct DenyAll;

impl Middleware for DenyAll {
    fn process_request<'a>(
        &'a self,
        _service: &'a str,
        _method: &'a str,
        _request: Vec<u8>,
    ) -> MiddlewareFuture<'a> {
        Box::pin(async move { Err(Status::invalid_argument("denied by policy")) })
    }
}

#[tokio::test]
async fn middleware_veto_rejects_the_call() {
    let (client, server) = endpoint_pair();
    server.register_service(calc_service()).unwrap();
    server.add_middleware(DenyAll);

    let add = client
        .unary_request(
            "Calc",
            "add",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap();
    let err = add.call(&AddRequest { a: 1, b: 1 }).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Greeting {
    who: String,
}

#[tokio::test]
async fn payload_format_is_pluggable_per_method() {
    let (client, server) = endpoint_pair();
    server
        .register_service(ServiceContract::define("Json", |svc| {
            svc.unary(
                "greet",
                JsonCodec::new(),
                JsonCodec::new(),
                |_cx, req: Greeting| async move {
                    Ok::<String, Status>(format!("hello, {}", req.who))
                },
            );
        }))
        .unwrap();

    let greet = client
        .unary_request("Json", "greet", JsonCodec::<Greeting>::new(), JsonCodec::<String>::new())
        .unwrap();
    let response = greet
        .call(&Greeting { who: "weft".into() })
        .await
        .unwrap();
    assert_eq!(response, "hello, weft");
}

#[tokio::test]
async fn handler_panic_maps_to_internal() {
    let (client, server) = endpoint_pair();
    server
        .register_service(ServiceContract::define("Buggy", |svc| {
            svc.unary(
                "explode",
                PostcardCodec::<u32>::new(),
                PostcardCodec::<u32>::new(),
                |_cx, _req: u32| async move { panic!("boom") },
            );
        }))
        .unwrap();

    let call = client
        .unary_request(
            "Buggy",
            "explode",
            PostcardCodec::<u32>::new(),
            PostcardCodec::<u32>::new(),
        )
        .unwrap();
    let err = call.call(&1).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::Internal);

    settle().await;
    assert_eq!(server.active_streams(), 0);
}

#[tokio::test]
async fn engine_publishes_stream_lifecycle_events() {
    let (client_io, server_io) = weft_memory::memory_transport_pair(64);
    let (client, client_engine) =
        weft_session::Endpoint::client(client_io, weft_session::EndpointConfig::default());
    let (server, mut server_engine) =
        weft_session::Endpoint::server(server_io, weft_session::EndpointConfig::default());

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    server_engine.set_event_sink(events_tx);

    tokio::spawn(async move {
        let _ = client_engine.run().await;
    });
    tokio::spawn(async move {
        let _ = server_engine.run().await;
    });

    server.register_service(calc_service()).unwrap();
    let add = client
        .unary_request(
            "Calc",
            "add",
            PostcardCodec::<AddRequest>::new(),
            PostcardCodec::<AddResponse>::new(),
        )
        .unwrap();
    add.call(&AddRequest { a: 1, b: 2 }).await.unwrap();

    let opened = events_rx.recv().await.unwrap();
    assert!(
        matches!(&opened, EndpointEvent::StreamOpened { method, .. } if method.service == "Calc")
    );
    let closed = events_rx.recv().await.unwrap();
    assert!(matches!(
        closed,
        EndpointEvent::StreamClosed {
            code: StatusCode::Ok,
            ..
        }
    ));
}
