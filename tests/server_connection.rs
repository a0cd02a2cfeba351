//! Connection state machine tests over an in-memory pipe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rpc_transport::server::{handler_fn, CloseReason, HandlerError, HandlerRegistry};
use rpc_transport::{RpcRequest, RpcResponse};
use serde_json::json;

mod common;
use common::{raw_request, read_response, read_to_close, send_raw, spawn_connection, test_server_config};

/// `echo` that counts calls and optionally sleeps first.
fn counting_echo(calls: Arc<AtomicUsize>, delay: Duration) -> HandlerRegistry {
    HandlerRegistry::new().register(
        "echo",
        handler_fn(move |_ctx, request: RpcRequest| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, HandlerError>(RpcResponse::new(request.args))
            }
        }),
    )
}

#[tokio::test]
async fn sequential_requests_share_the_connection() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(calls.clone(), Duration::ZERO));

    for n in 0..2 {
        let body = json!({ "n": n }).to_string();
        send_raw(&mut client, raw_request("echo", &body, "x-request-id: req-7\r\n").as_bytes()).await;
        let response = read_response(&mut client).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, body);
        assert_eq!(response.header("connection").as_deref(), Some("keep-alive"));
        assert_eq!(response.header("x-request-id").as_deref(), Some("req-7"));
        assert!(response.header("content-type").unwrap().starts_with("application/json"));
    }

    drop(client);
    let summary = summary.await.unwrap();
    assert_eq!(summary.reason, CloseReason::PeerClosed);
    assert_eq!(summary.requests, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn oversized_body_is_rejected_before_reading_it() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(calls.clone(), Duration::ZERO));

    // Head only: the declared length alone must trigger the rejection.
    send_raw(
        &mut client,
        b"POST /echo HTTP/1.1\r\nHost: test\r\ncontent-type: application/json\r\ncontent-length: 4096\r\n\r\n",
    )
    .await;

    let response = read_response(&mut client).await.unwrap();
    assert_eq!(response.status, 413);
    assert_eq!(response.header("connection").as_deref(), Some("close"));

    let summary = summary.await.unwrap();
    assert_eq!(summary.reason, CloseReason::BodyTooLarge);
    assert_eq!(summary.body_bytes_read, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn chunked_body_over_the_limit_is_rejected() {
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    let chunk = "x".repeat(800);
    let raw = format!(
        "POST /echo HTTP/1.1\r\nHost: test\r\ntransfer-encoding: chunked\r\n\r\n\
         320\r\n{chunk}\r\n320\r\n{chunk}\r\n0\r\n\r\n"
    );
    send_raw(&mut client, raw.as_bytes()).await;

    assert_eq!(read_response(&mut client).await.unwrap().status, 413);
    assert_eq!(summary.await.unwrap().reason, CloseReason::BodyTooLarge);
}

#[tokio::test]
async fn chunked_body_is_decoded() {
    let (mut client, _summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    let raw = "POST /echo HTTP/1.1\r\nHost: test\r\ncontent-type: application/json\r\n\
               transfer-encoding: chunked\r\n\r\n5\r\n{\"a\":\r\n3\r\n12}\r\n0\r\n\r\n";
    send_raw(&mut client, raw.as_bytes()).await;

    let response = read_response(&mut client).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, r#"{"a":12}"#);
}

#[tokio::test]
async fn chunked_terminator_may_arrive_in_a_later_read() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (mut client, _summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(calls.clone(), Duration::ZERO));

    send_raw(
        &mut client,
        b"POST /echo HTTP/1.1\r\nHost: test\r\ncontent-type: application/json\r\n\
          transfer-encoding: chunked\r\n\r\n2\r\n42\r\n0\r\n",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send_raw(&mut client, b"\r\n").await;

    let response = read_response(&mut client).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "42");
    assert_eq!(response.header("connection").as_deref(), Some("keep-alive"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pipelined_requests_close_without_dispatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(calls.clone(), Duration::ZERO));

    let two = format!("{}{}", raw_request("echo", "1", ""), raw_request("echo", "2", ""));
    send_raw(&mut client, two.as_bytes()).await;

    assert!(read_to_close(&mut client).await.is_empty());
    assert_eq!(summary.await.unwrap().reason, CloseReason::Pipelining);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_during_dispatch_closes_the_connection() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(calls.clone(), Duration::from_millis(300)));

    send_raw(&mut client, raw_request("echo", "1", "").as_bytes()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send_raw(&mut client, raw_request("echo", "2", "").as_bytes()).await;

    assert!(read_to_close(&mut client).await.is_empty());
    assert_eq!(summary.await.unwrap().reason, CloseReason::Pipelining);
    // The second request never reached a handler.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_service_gets_501_and_close() {
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    send_raw(&mut client, raw_request("missing", "{}", "").as_bytes()).await;

    let response = read_response(&mut client).await.unwrap();
    assert_eq!(response.status, 501);
    assert!(response.body.contains("missing"));
    assert_eq!(summary.await.unwrap().reason, CloseReason::NoHandler);
}

#[tokio::test]
async fn handler_errors_map_to_status_and_keep_the_connection() {
    let registry = HandlerRegistry::new().register(
        "guarded",
        handler_fn(|_ctx, _request| async { Err::<RpcResponse, _>(HandlerError::Forbidden("no access".into())) }),
    );
    let (mut client, _summary, _shutdown) = spawn_connection(test_server_config(), registry);

    for _ in 0..2 {
        send_raw(&mut client, raw_request("guarded", "{}", "").as_bytes()).await;
        let response = read_response(&mut client).await.unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(response.header("connection").as_deref(), Some("keep-alive"));
    }
}

#[tokio::test]
async fn undecodable_body_is_400() {
    let (mut client, _summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    send_raw(&mut client, raw_request("echo", "{not json", "").as_bytes()).await;
    assert_eq!(read_response(&mut client).await.unwrap().status, 400);

    // Still usable afterwards.
    send_raw(&mut client, raw_request("echo", "[1]", "").as_bytes()).await;
    assert_eq!(read_response(&mut client).await.unwrap().body, "[1]");
}

#[tokio::test]
async fn connection_close_is_honoured() {
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    send_raw(&mut client, raw_request("echo", "1", "connection: close\r\n").as_bytes()).await;
    let response = read_response(&mut client).await.unwrap();
    assert_eq!(response.header("connection").as_deref(), Some("close"));
    assert_eq!(summary.await.unwrap().reason, CloseReason::ConnectionClose);
}

#[tokio::test]
async fn keepalive_bound_closes_after_last_permitted_request() {
    let config = rpc_transport::config::ServerConfig {
        keepalive_requests: 2,
        ..test_server_config()
    };
    let (mut client, summary, _shutdown) = spawn_connection(config, counting_echo(Arc::default(), Duration::ZERO));

    send_raw(&mut client, raw_request("echo", "1", "").as_bytes()).await;
    assert_eq!(
        read_response(&mut client).await.unwrap().header("connection").as_deref(),
        Some("keep-alive")
    );
    send_raw(&mut client, raw_request("echo", "2", "").as_bytes()).await;
    assert_eq!(
        read_response(&mut client).await.unwrap().header("connection").as_deref(),
        Some("close")
    );

    let summary = summary.await.unwrap();
    assert_eq!(summary.reason, CloseReason::KeepaliveExhausted);
    assert_eq!(summary.requests, 2);
}

#[tokio::test(start_paused = true)]
async fn idle_connection_times_out() {
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));
    let started = tokio::time::Instant::now();

    send_raw(&mut client, raw_request("echo", "1", "").as_bytes()).await;
    assert_eq!(read_response(&mut client).await.unwrap().status, 200);
    let answered = started.elapsed();

    let summary = summary.await.unwrap();
    assert_eq!(summary.reason, CloseReason::IdleTimeout);
    // Timer re-armed after the response, not from connection open.
    assert!(started.elapsed() >= answered + Duration::from_secs(5));
}

#[tokio::test]
async fn shutdown_closes_idle_connection() {
    let (_client, summary, shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));
    tokio::task::yield_now().await;

    shutdown.trigger();
    let summary = tokio::time::timeout(Duration::from_secs(1), summary).await.unwrap().unwrap();
    assert_eq!(summary.reason, CloseReason::Shutdown);
}

#[tokio::test]
async fn malformed_head_is_400_and_close() {
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    send_raw(&mut client, b"NOT A REQUEST\r\n\r\n").await;
    assert_eq!(read_response(&mut client).await.unwrap().status, 400);
    assert!(matches!(summary.await.unwrap().reason, CloseReason::ProtocolViolation(_)));
}

#[tokio::test]
async fn oversized_head_is_431() {
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    let filler = "a".repeat(20 * 1024);
    let raw = format!("POST /echo HTTP/1.1\r\nx-filler: {filler}\r\n\r\n");
    send_raw(&mut client, raw.as_bytes()).await;

    assert_eq!(read_response(&mut client).await.unwrap().status, 431);
    assert_eq!(summary.await.unwrap().reason, CloseReason::HeadTooLarge);
}

#[tokio::test]
async fn non_websocket_upgrade_is_refused() {
    let (mut client, summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    send_raw(
        &mut client,
        b"GET /echo HTTP/1.1\r\nHost: test\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n",
    )
    .await;

    let response = read_response(&mut client).await.unwrap();
    assert_eq!(response.status, 426);
    assert_eq!(response.header("upgrade").as_deref(), Some("websocket"));
    assert_eq!(summary.await.unwrap().reason, CloseReason::UpgradeRejected);
}

#[tokio::test]
async fn websocket_upgrade_switches_protocols() {
    let (mut client, _summary, _shutdown) =
        spawn_connection(test_server_config(), counting_echo(Arc::default(), Duration::ZERO));

    send_raw(
        &mut client,
        b"GET /duplex HTTP/1.1\r\nHost: test\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
          Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
    )
    .await;

    let response = read_response(&mut client).await.unwrap();
    assert_eq!(response.status, 101);
    assert_eq!(
        response.header("sec-websocket-accept").as_deref(),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
}
