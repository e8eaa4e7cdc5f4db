//! HTTP transport.
//!
//! Each send is an HTTP POST of one JSON value; the response body is the
//! correlated reply and is pushed onto the incoming channel, so the
//! protocol client's correlation path is identical to the streaming
//! transports. There are no server-to-client notifications over HTTP.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::header;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Transport, TransportError};

/// Default per-request HTTP timeout in seconds.
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// HTTP transport for tool servers reachable at a single POST endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    incoming: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl HttpTransport {
    /// Create the transport and its incoming message channel.
    pub fn new(
        url: impl Into<String>,
        headers: HashMap<String, String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Value>), TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                client,
                url: url.into(),
                headers,
                incoming: Mutex::new(Some(tx)),
            },
            rx,
        ))
    }
}

impl Transport for HttpTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.incoming.lock().unwrap().is_none() {
            return Err(TransportError::Closed);
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json");
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .json(&message)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        // Notifications get an empty reply; only parse and deliver actual
        // response bodies.
        if body.trim().is_empty() {
            return Ok(());
        }

        let reply: Value = serde_json::from_str(&body)?;
        if let Some(tx) = self.incoming.lock().unwrap().as_ref() {
            let _ = tx.send(reply);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping the sender closes the incoming channel.
        self.incoming.lock().unwrap().take();
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

    #[tokio::test]
    async fn send_after_close_is_closed_error() {
        let (transport, _rx) = HttpTransport::new("http://127.0.0.1:9/rpc", HashMap::new()).unwrap();
        transport.close().await.unwrap();

        let err = transport.send(json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn close_drops_the_incoming_channel() {
        let (transport, mut rx) =
            HttpTransport::new("http://127.0.0.1:9/rpc", HashMap::new()).unwrap();
        transport.close().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_http_error() {
        // Port 9 (discard) is not listening; the connect fails fast.
        let (transport, _rx) =
            HttpTransport::new("http://127.0.0.1:9/rpc", HashMap::new()).unwrap();
        let err = transport
            .send(json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Http(_)));
    }
}
