//! WebSocket transport.
//!
//! A single long-lived connection; each text frame is one JSON value in
//! either direction. A background read loop feeds the incoming channel and
//! drops it when the connection closes.

use std::collections::HashMap;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// WebSocket transport for tool servers.
pub struct WebsocketTransport {
    sink: Mutex<Option<WsSink>>,
}

impl WebsocketTransport {
    /// Connect and return the transport plus its incoming message channel.
    pub async fn connect(
        url: &str,
        protocols: &[String],
        headers: &HashMap<String, String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Value>), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TransportError::WebSocket(format!("bad header '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::WebSocket(format!("bad header '{key}': {e}")))?;
            request.headers_mut().insert(name, value);
        }
        if !protocols.is_empty() {
            let joined = protocols.join(", ");
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(&joined)
                    .map_err(|e| TransportError::WebSocket(e.to_string()))?,
            );
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (sink, mut source) = stream.split();

        let (tx, rx) = mpsc::unbounded_channel();

        // Read loop: one JSON value per text frame. Dropping `tx` signals
        // connection loss to the protocol client.
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable websocket frame");
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::debug!("websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                sink: Mutex::new(Some(sink)),
            },
            rx,
        ))
    }
}

impl Transport for WebsocketTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;

        let text = serde_json::to_string(&message)?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Minimal in-process websocket echo server.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let (mut sink, mut source) = ws.split();
                    while let Some(Ok(msg)) = source.next().await {
                        if let Message::Text(text) = msg {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn echo_roundtrip() {
        let url = spawn_echo_server().await;
        let (transport, mut rx) =
            WebsocketTransport::connect(&url, &[], &HashMap::new()).await.unwrap();

        let message = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" });
        transport.send(message.clone()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), message);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_is_closed_error() {
        let url = spawn_echo_server().await;
        let (transport, _rx) =
            WebsocketTransport::connect(&url, &[], &HashMap::new()).await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send(json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn refused_connection_is_a_websocket_error() {
        let result =
            WebsocketTransport::connect("ws://127.0.0.1:9", &[], &HashMap::new()).await;
        assert!(matches!(result, Err(TransportError::WebSocket(_))));
    }
}
