//! WebSocket transport over tokio-tungstenite.
//!
//! Each connection runs two tasks: a writer draining an unbounded queue into
//! the socket, and a reader forwarding inbound frames as [`TransportEvent`]s.
//! Text and binary frames are both delivered as raw bytes.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{Link, Transport, TransportError, TransportEvent};

/// Opens WebSocket connections with `connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct WsLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Link for WsLink {
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(Outbound::Frame(bytes)).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// JSON envelopes go out as text frames; anything that is not UTF-8 as binary.
fn to_message(bytes: Vec<u8>) -> Message {
    match String::from_utf8(bytes) {
        Ok(text) => Message::Text(text.into()),
        Err(err) => Message::Binary(err.into_bytes().into()),
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn Link>, TransportError> {
        let (stream, _) = connect_async(endpoint).await.map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let _ = events.send(TransportEvent::Opened);

        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Frame(bytes) => {
                        if let Err(e) = sink.send(to_message(bytes)).await {
                            debug!(error = %e, "ws: write failed");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => TransportEvent::Frame(text.as_str().as_bytes().to_vec()),
                    Ok(Message::Binary(bytes)) => TransportEvent::Frame(bytes.to_vec()),
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default();
                        let _ = events.send(TransportEvent::Closed(reason));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "ws: read failed");
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                if events.send(event).is_err() {
                    // Receiver dropped: the engine has moved on from this connection.
                    return;
                }
            }
            let _ = events.send(TransportEvent::Closed("stream ended".to_owned()));
        });

        Ok(Box::new(WsLink { tx }))
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
