//! Queue-backed view of a WebSocket.
//!
//! A reader task decodes frames into the inbound queue and a writer task
//! drains the outbound queue onto the socket. The channel is lost when the
//! inbound queue ends; dropping every [`Outbox`] closes the socket.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::duplex::Envelope;
use crate::rpc::{TransportError, TransportResult};

const OUTBOUND_QUEUE: usize = 256;
const INBOUND_QUEUE: usize = 256;

/// Sending half of a duplex channel.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, envelope: Envelope) -> TransportResult<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| TransportError::ChannelLost("duplex channel closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An established duplex channel.
#[derive(Debug)]
pub struct DuplexChannel {
    pub outbox: Outbox,
    /// Ends when the peer goes away.
    pub inbound: mpsc::Receiver<Envelope>,
}

impl DuplexChannel {
    /// A channel over in-memory queues; the returned ends belong to the peer.
    pub fn pair() -> (DuplexChannel, mpsc::Receiver<Envelope>, mpsc::Sender<Envelope>) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        (
            DuplexChannel {
                outbox: Outbox::new(out_tx),
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Run reader and writer tasks for `ws`.
pub fn pump<S>(ws: WebSocketStream<S>, label: String) -> DuplexChannel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (channel, mut out_rx, in_tx) = DuplexChannel::pair();

    let writer_label = label.clone();
    tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let text = match envelope.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(peer = %writer_label, error = %e, "Dropping unencodable envelope");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(text)).await {
                tracing::debug!(peer = %writer_label, error = %e, "Duplex write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let envelope = match frame {
                Ok(Message::Text(text)) => Envelope::decode(text.as_bytes()),
                Ok(Message::Binary(data)) => Envelope::decode(&data),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(peer = %label, error = %e, "Duplex read failed");
                    break;
                }
            };
            match envelope {
                Ok(envelope) => {
                    if in_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(peer = %label, error = %e, "Ignoring undecodable duplex frame"),
            }
        }
        tracing::debug!(peer = %label, "Duplex channel ended");
    });

    channel
}
