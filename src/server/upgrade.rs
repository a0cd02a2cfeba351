//! Protocol upgrade to a duplex channel.
//!
//! Only WebSocket (RFC 6455) upgrades are accepted. Once switched, the
//! connection is served by [`serve_duplex`]: request envelopes are dispatched
//! to the same handler registry as plain HTTP calls.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use hyper::header::{HeaderMap, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::Method;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::duplex::{channel, Envelope, EnvelopeBody, Outbox};
use crate::lifecycle::ShutdownSignal;
use crate::rpc::{JsonCodec, PayloadCodec, RpcHead};
use crate::server::handler::ServerContext;
use crate::server::http1::RequestHead;
use crate::server::registry::{CallContext, HandlerError};
use crate::server::state::CloseReason;

/// Check a WebSocket upgrade request and produce the 101 response headers.
pub(crate) fn accept_websocket(head: &RequestHead) -> Result<HeaderMap, &'static str> {
    if head.method != Method::GET {
        return Err("upgrade requires GET");
    }
    if !head
        .header(&UPGRADE)
        .map(|u| u.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err("only websocket upgrades are supported");
    }
    if head.header(&SEC_WEBSOCKET_VERSION) != Some("13") {
        return Err("unsupported websocket version");
    }
    let key = head
        .header(&SEC_WEBSOCKET_KEY)
        .ok_or("missing sec-websocket-key")?;

    let accept = HeaderValue::from_str(&derive_accept_key(key.trim().as_bytes()))
        .map_err(|_| "invalid sec-websocket-key")?;
    let mut headers = HeaderMap::new();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    Ok(headers)
}

/// Serve an upgraded connection until the peer leaves or shutdown.
///
/// `leftover` holds bytes already read past the upgrade request.
pub(crate) async fn serve_duplex<I>(
    io: I,
    leftover: BytesMut,
    peer: Option<SocketAddr>,
    ctx: Arc<ServerContext>,
    mut shutdown: ShutdownSignal,
) -> CloseReason
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = WebSocketStream::from_partially_read(io, leftover.to_vec(), Role::Server, None).await;
    let label = peer.map(|p| p.to_string()).unwrap_or_else(|| "duplex-peer".into());
    let mut channel = channel::pump(ws, label);
    tracing::debug!(peer = ?peer, "Duplex channel established");

    loop {
        tokio::select! {
            _ = shutdown.recv() => return CloseReason::Shutdown,
            envelope = channel.inbound.recv() => match envelope {
                Some(envelope) => dispatch(envelope, peer, &ctx, &channel.outbox),
                None => return CloseReason::Upgraded,
            },
        }
    }
}

fn dispatch(envelope: Envelope, peer: Option<SocketAddr>, ctx: &Arc<ServerContext>, outbox: &Outbox) {
    let id = envelope.id;
    let Some(request) = envelope.to_request() else {
        // Replies to server pushes; pushes are fire-and-forget.
        if let EnvelopeBody::Error { status, message } = envelope.body {
            tracing::debug!(id, status, message = %message, "Peer rejected a pushed message");
        }
        return;
    };

    let wants_reply = request.channel.expects_reply();
    let outbox = outbox.clone();
    let Some(handler) = ctx.registry.resolve(&request.service) else {
        tracing::debug!(service = %request.service, "No handler for duplex request");
        if wants_reply {
            tokio::spawn(async move {
                let message = format!("no handler for '{}'", request.service);
                let _ = outbox.send(Envelope::error(id, 501, message)).await;
            });
        }
        return;
    };

    let call = CallContext {
        head: RpcHead::for_request(&request, JsonCodec.content_type()),
        peer,
        push: Some(outbox.clone()),
    };
    tokio::spawn(async move {
        let service = request.service.clone();
        let result = handler.handle(&call, request).await;
        if !wants_reply {
            if let Err(e) = result {
                tracing::debug!(service = %service, error = %e, "Notification handler failed");
            }
            return;
        }
        let reply = match result {
            Ok(response) => Envelope::response(id, response),
            Err(e) => Envelope::error(id, status_of(&e), e.to_string()),
        };
        let _ = outbox.send(reply).await;
    });
}

fn status_of(error: &HandlerError) -> u16 {
    error.status().as_u16()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &[u8]) -> RequestHead {
        RequestHead::parse(raw).unwrap().unwrap().0
    }

    #[test]
    fn accepts_valid_websocket_upgrade() {
        let head = head(
            b"GET /duplex HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        let headers = accept_websocket(&head).unwrap();
        // RFC 6455 section 1.3 example.
        assert_eq!(headers[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn rejects_other_protocols_and_missing_key() {
        let h2c = head(b"GET / HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n");
        assert!(accept_websocket(&h2c).is_err());

        let no_key = head(
            b"GET / HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );
        assert_eq!(accept_websocket(&no_key), Err("missing sec-websocket-key"));
    }
}
