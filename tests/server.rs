//! End-to-end tests for the plain server over real sockets.

mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, StatusCode};

use hearth::{
    Handler, HandlerError, HttpServer, Response, ServerAddress, ServerFactory, ServerKind,
    ServerOptions, ServerState, WebServer,
};

use common::{send, send_with_headers};

fn loopback() -> ServerAddress {
    ServerAddress::new("127.0.0.1", 0)
}

fn text(body: &'static str) -> Handler {
    Handler::new(move |_req, res| res.text(StatusCode::OK, body))
}

fn start(server: &mut HttpServer) -> SocketAddr {
    server.run().expect("server starts");
    server.local_addr().expect("bound address")
}

// =============================================================================
// Dispatch
// =============================================================================

#[test]
fn test_status_exact_prefix_and_method_mismatch() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 2).unwrap();
    server.add_handler("/status", Method::GET, text("handler A")).unwrap();
    let addr = start(&mut server);

    let exact = send(addr, "GET", "/status", "");
    assert_eq!(exact.status, 200);
    assert_eq!(exact.body, "handler A");

    let prefixed = send(addr, "GET", "/status/extra", "");
    assert_eq!(prefixed.status, 200);
    assert_eq!(prefixed.body, "handler A");

    let wrong_method = send(addr, "POST", "/status", "");
    assert_eq!(wrong_method.status, 404);
}

#[test]
fn test_unmatched_path_does_not_invoke_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server
        .add_handler(
            "/status",
            Method::GET,
            Handler::new(move |_req, res| {
                counter.fetch_add(1, Ordering::SeqCst);
                res.text(StatusCode::OK, "ok");
            }),
        )
        .unwrap();
    let addr = start(&mut server);

    let response = send(addr, "GET", "/missing", "");
    assert_eq!(response.status, 404);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_latest_registration_wins() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server.add_handler("/status", Method::GET, text("old")).unwrap();
    server.add_handler("/status", Method::GET, text("new")).unwrap();
    let addr = start(&mut server);

    assert_eq!(send(addr, "GET", "/status", "").body, "new");
}

#[test]
fn test_late_registration_does_not_change_routing() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server.add_handler("/status", Method::GET, text("original")).unwrap();
    let addr = start(&mut server);

    assert!(server.add_handler("/status", Method::GET, text("late")).is_err());
    assert!(server.add_handler("/late", Method::GET, text("late")).is_err());

    assert_eq!(send(addr, "GET", "/status", "").body, "original");
    assert_eq!(send(addr, "GET", "/late", "").status, 404);
}

#[test]
fn test_handler_sees_method_headers_and_body() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server
        .add_handler(
            "/inspect",
            Method::PUT,
            Handler::new(|req, res| {
                let header = req
                    .headers()
                    .get("x-trace")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string();
                let summary = format!(
                    "{} {} {} {}",
                    req.method(),
                    req.uri().path(),
                    header,
                    String::from_utf8_lossy(req.body())
                );
                res.text(StatusCode::CREATED, summary);
            }),
        )
        .unwrap();
    let addr = start(&mut server);

    let response = send_with_headers(addr, "PUT", "/inspect/item", &[("X-Trace", "abc")], "payload");
    assert_eq!(response.status, 201);
    assert_eq!(response.body, "PUT /inspect/item abc payload");
}

#[test]
fn test_custom_response_headers_pass_through() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server
        .add_handler(
            "/json",
            Method::GET,
            Handler::new(|_req, res| {
                let mut response = Response::new(Bytes::from_static(b"{\"ok\":true}"));
                response
                    .headers_mut()
                    .insert("content-type", "application/json".parse().unwrap());
                res.send(response);
            }),
        )
        .unwrap();
    let addr = start(&mut server);

    let response = send(addr, "GET", "/json", "");
    assert_eq!(response.status, 200);
    assert!(response.head.to_ascii_lowercase().contains("content-type: application/json"));
    assert_eq!(response.body, "{\"ok\":true}");
}

// =============================================================================
// Handler failures
// =============================================================================

#[test]
fn test_handler_failures_become_server_errors() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server
        .add_handler(
            "/fail",
            Method::GET,
            Handler::new(|_req, res| res.fail(HandlerError::new("database unavailable"))),
        )
        .unwrap();
    server
        .add_handler("/panic", Method::GET, Handler::new(|_req, _res| panic!("handler bug")))
        .unwrap();
    server
        .add_handler("/silent", Method::GET, Handler::new(|_req, _res| {}))
        .unwrap();
    server.add_handler("/ok", Method::GET, text("still up")).unwrap();
    let addr = start(&mut server);

    assert_eq!(send(addr, "GET", "/fail", "").status, 500);
    assert_eq!(send(addr, "GET", "/panic", "").status, 500);
    assert_eq!(send(addr, "GET", "/silent", "").status, 500);

    let after = send(addr, "GET", "/ok", "");
    assert_eq!(after.status, 200);
    assert_eq!(after.body, "still up");
}

#[test]
fn test_async_responder() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server
        .add_handler(
            "/later",
            Method::GET,
            Handler::new(|_req, res| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    res.text(StatusCode::ACCEPTED, "done");
                });
            }),
        )
        .unwrap();
    let addr = start(&mut server);

    let response = send(addr, "GET", "/later", "");
    assert_eq!(response.status, 202);
    assert_eq!(response.body, "done");
}

#[test]
fn test_oversized_body_rejected_without_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let options = ServerOptions {
        max_body_bytes: 8,
        ..ServerOptions::default()
    };
    let mut server = HttpServer::with_options(options);
    server.init_with_threads(loopback(), 1).unwrap();
    server
        .add_handler(
            "/upload",
            Method::POST,
            Handler::new(move |_req, res| {
                counter.fetch_add(1, Ordering::SeqCst);
                res.text(StatusCode::OK, "stored");
            }),
        )
        .unwrap();
    let addr = start(&mut server);

    assert_eq!(send(addr, "POST", "/upload", "small").status, 200);
    assert_eq!(send(addr, "POST", "/upload", "far too large a body").status, 413);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Unknown paths are rejected before the body is looked at.
    assert_eq!(send(addr, "POST", "/elsewhere", "far too large a body").status, 404);
}

#[test]
fn test_incomplete_headers_closed_after_timeout() {
    let options = ServerOptions {
        header_read_timeout: Duration::from_millis(200),
        ..ServerOptions::default()
    };
    let mut server = HttpServer::with_options(options);
    server.init_with_threads(loopback(), 1).unwrap();
    server.add_handler("/status", Method::GET, text("ok")).unwrap();
    let addr = start(&mut server);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\n").unwrap();

    let started = Instant::now();
    let mut raw = Vec::new();
    let read = stream.read_to_end(&mut raw);
    let elapsed = started.elapsed();

    if let Err(e) = &read {
        assert!(
            !matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
            "connection stayed open: {e}"
        );
    }
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(4));
    assert!(!String::from_utf8_lossy(&raw).contains("200 OK"));

    // Complete requests are still served.
    assert_eq!(send(addr, "GET", "/status", "").status, 200);
}

// =============================================================================
// Concurrency and execution contexts
// =============================================================================

#[test]
fn test_slow_handler_does_not_block_other_connections() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server
        .add_handler(
            "/slow",
            Method::GET,
            Handler::new(|_req, res| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(800)).await;
                    res.text(StatusCode::OK, "slow");
                });
            }),
        )
        .unwrap();
    server.add_handler("/fast", Method::GET, text("fast")).unwrap();
    let addr = start(&mut server);

    let slow = thread::spawn(move || send(addr, "GET", "/slow", ""));
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let fast = send(addr, "GET", "/fast", "");
    assert_eq!(fast.body, "fast");
    assert!(started.elapsed() < Duration::from_millis(700));

    assert_eq!(slow.join().unwrap().body, "slow");
}

#[test]
fn test_owned_pool_threads_joined_on_drop() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 3).unwrap();
    server.add_handler("/status", Method::GET, text("ok")).unwrap();
    let addr = start(&mut server);
    assert_eq!(send(addr, "GET", "/status", "").status, 200);

    let pool = server.worker_pool().unwrap();
    assert_eq!(pool.size(), 3);
    let live = pool.live_threads();
    let deadline = Instant::now() + Duration::from_secs(5);
    while live.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(live.load(Ordering::SeqCst), 3);

    drop(server);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_drop_waits_for_in_flight_request() {
    let mut server = HttpServer::new();
    server.init_with_threads(loopback(), 1).unwrap();
    server
        .add_handler(
            "/slow",
            Method::GET,
            Handler::new(|_req, res| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    res.text(StatusCode::OK, "finished");
                });
            }),
        )
        .unwrap();
    let addr = start(&mut server);

    let client = thread::spawn(move || send(addr, "GET", "/slow", ""));
    thread::sleep(Duration::from_millis(100));
    drop(server);

    let response = client.join().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "finished");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_external_runtime_outlives_server() {
    let factory = ServerFactory::default();
    let mut server = factory.create(ServerKind::Plain, loopback(), tokio::runtime::Handle::current());
    server.add_handler("/status", Method::GET, text("ok")).unwrap();
    server.run().unwrap();
    assert_eq!(server.state(), ServerState::Running);
    let addr = server.local_addr().unwrap();

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let response = common::send_async(stream, "GET", "/status", "").await;
    assert_eq!(response.body, "ok");

    drop(server);

    // The caller's runtime keeps working.
    let value = tokio::spawn(async { 41 + 1 }).await.unwrap();
    assert_eq!(value, 42);

    // The listener goes away once its accept loop observes the shutdown.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if tokio::net::TcpStream::connect(addr).await.is_err() {
            break;
        }
        assert!(Instant::now() < deadline, "listener still accepting after drop");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_external_runtime_drains_in_flight_request() {
    let factory = ServerFactory::default();
    let mut server = factory.create(ServerKind::Plain, loopback(), tokio::runtime::Handle::current());
    server
        .add_handler(
            "/slow",
            Method::GET,
            Handler::new(|_req, res| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    res.text(StatusCode::OK, "done");
                });
            }),
        )
        .unwrap();
    server.run().unwrap();
    let addr = server.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        common::send_async(stream, "GET", "/slow", "").await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    drop(server);
    assert!(started.elapsed() < Duration::from_millis(100));

    let response = client.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "done");
}

#[test]
fn test_shutdown_drains_on_current_thread_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let factory = ServerFactory::default();
    let mut server = factory.create(ServerKind::Plain, loopback(), runtime.handle().clone());
    server
        .add_handler(
            "/slow",
            Method::GET,
            Handler::new(|_req, res| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    res.text(StatusCode::OK, "finished");
                });
            }),
        )
        .unwrap();
    server.run().unwrap();
    let addr = server.local_addr().unwrap();

    let client = thread::spawn(move || send(addr, "GET", "/slow", ""));
    runtime.block_on(async { tokio::time::sleep(Duration::from_millis(100)).await });

    let drain = server.shutdown();
    drop(server);
    assert!(runtime.block_on(drain));
    drop(runtime);

    let response = client.join().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "finished");
}

#[test]
fn test_shutdown_reports_grace_elapsed() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let options = ServerOptions {
        shutdown_grace: Duration::from_millis(100),
        ..ServerOptions::default()
    };
    let mut server = ServerFactory::new(options).create(
        ServerKind::Plain,
        loopback(),
        runtime.handle().clone(),
    );
    server
        .add_handler(
            "/stuck",
            Method::GET,
            Handler::new(|_req, res| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    res.text(StatusCode::OK, "late");
                });
            }),
        )
        .unwrap();
    server.run().unwrap();
    let addr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(common::build_request("GET", "/stuck", &[], "").as_bytes())
            .unwrap();
        let mut raw = Vec::new();
        let _ = stream.read_to_end(&mut raw);
    });
    runtime.block_on(async { tokio::time::sleep(Duration::from_millis(100)).await });

    let drain = server.shutdown();
    drop(server);
    assert!(!runtime.block_on(drain));
    drop(runtime);

    client.join().unwrap();
}
