//! Keepalive sessions against a live RPC server over WebSocket.

use std::time::Duration;

use rpc_transport::config::KeepaliveConfig;
use rpc_transport::duplex::Envelope;
use rpc_transport::server::{handler_fn, HandlerError, HandlerRegistry};
use rpc_transport::{ChannelKind, KeepaliveSession, RpcRequest, RpcResponse, TransportError};
use serde_json::json;

mod common;
use common::{test_server_config, Node};

fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            "echo",
            handler_fn(|_ctx, request: RpcRequest| async move {
                Ok::<_, HandlerError>(RpcResponse::new(request.args))
            }),
        )
        .register(
            "echo.push",
            handler_fn(|ctx, request: RpcRequest| async move {
                let Some(push) = ctx.push else {
                    return Err(HandlerError::BadRequest("duplex only".into()));
                };
                let message = RpcRequest::new("echo.push")
                    .with_channel(ChannelKind::Notify)
                    .with_args(request.args);
                push.send(Envelope::request(0, &message))
                    .await
                    .map_err(|e| HandlerError::Unavailable(e.to_string()))?;
                Ok(RpcResponse::empty())
            }),
        )
}

fn config() -> KeepaliveConfig {
    KeepaliveConfig {
        request_timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        ..KeepaliveConfig::default()
    }
}

#[tokio::test]
async fn request_reply_over_upgraded_connection() {
    let node = Node::start(test_server_config(), registry()).await;
    let session = KeepaliveSession::connect_ws(&node.ws_url(), config()).unwrap();
    assert!(session.wait_connected(Duration::from_secs(2)).await);
    assert_eq!(session.attempts(), 1);

    for n in 0..3 {
        let reply = session
            .request(RpcRequest::new("echo").with_args(json!({ "n": n })))
            .await
            .unwrap();
        assert_eq!(reply.value, json!({ "n": n }));
    }

    let err = session.request(RpcRequest::new("missing")).await.unwrap_err();
    assert!(matches!(err, TransportError::Status { status: 501, .. }));
}

#[tokio::test]
async fn server_push_reaches_subscribers() {
    let node = Node::start(test_server_config(), registry()).await;
    let session = KeepaliveSession::connect_ws(&node.ws_url(), config()).unwrap();
    let mut pushes = session.subscribe();
    assert!(session.wait_connected(Duration::from_secs(2)).await);

    session
        .request(RpcRequest::new("echo.push").with_args(json!("tick")))
        .await
        .unwrap();

    let push = tokio::time::timeout(Duration::from_secs(2), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    let request = push.to_request().unwrap();
    assert_eq!(request.service, "echo.push");
    assert_eq!(request.channel, ChannelKind::Notify);
    assert_eq!(request.args, json!("tick"));
}

#[tokio::test]
async fn notify_gets_no_reply() {
    let node = Node::start(test_server_config(), registry()).await;
    let session = KeepaliveSession::connect_ws(&node.ws_url(), config()).unwrap();
    let mut pushes = session.subscribe();
    assert!(session.wait_connected(Duration::from_secs(2)).await);

    session.notify(RpcRequest::new("echo").with_args(json!(1))).await.unwrap();
    // A request afterwards still gets its own reply, not a stray one.
    let reply = session.request(RpcRequest::new("echo").with_args(json!(2))).await.unwrap();
    assert_eq!(reply.value, json!(2));
    assert!(pushes.try_recv().is_err());
}

#[tokio::test]
async fn server_shutdown_drops_the_session_to_disconnected() {
    let node = Node::start(test_server_config(), registry()).await;
    let session = KeepaliveSession::connect_ws(&node.ws_url(), config()).unwrap();
    assert!(session.wait_connected(Duration::from_secs(2)).await);

    node.shutdown.trigger();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while session.is_connected() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!session.is_connected());
    assert!(session.reconnect_pending());
    let err = session.request(RpcRequest::new("echo")).await.unwrap_err();
    assert_eq!(err.kind(), "channel_lost");
}

#[tokio::test]
async fn unreachable_url_schedules_a_retry() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let session = KeepaliveSession::connect_ws(&format!("ws://127.0.0.1:{port}/duplex"), config()).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !session.reconnect_pending() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(session.reconnect_pending());
    assert_eq!(session.attempts(), 1);
    assert!(!session.is_connected());
}

#[test]
fn invalid_url_is_rejected() {
    let err = KeepaliveSession::connect_ws("not a url", KeepaliveConfig::default()).unwrap_err();
    assert_eq!(err.kind(), "invalid_endpoint");
}
