//! Message-oriented transports beneath the protocol client.
//!
//! A transport sends one JSON value at a time and delivers incoming JSON
//! values on the channel handed back by its constructor. The channel closes
//! when the underlying connection dies, which is how the protocol client
//! learns about transport loss. All three transports share this shape so a
//! single correlation path serves stdio, HTTP, and WebSocket alike.

pub mod http;
pub mod stdio;
pub mod websocket;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use thiserror::Error;

pub use http::HttpTransport;
pub use stdio::StdioTransport;
pub use websocket::WebsocketTransport;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("process error: {0}")]
    Process(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection closed")]
    Closed,
}

/// A bidirectional JSON message transport.
///
/// Uses native async fn in traits; [`BoxTransport`] provides the
/// object-safe wrapper for dynamic dispatch.
pub trait Transport: Send + Sync {
    /// Send one JSON value.
    fn send(
        &self,
        message: Value,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the transport. Idempotent.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Object-safe version of [`Transport`] with boxed futures.
pub trait TransportDyn: Send + Sync {
    fn send_boxed<'a>(
        &'a self,
        message: Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    fn close_boxed<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;
}

impl<T: Transport> TransportDyn for T {
    fn send_boxed<'a>(
        &'a self,
        message: Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(self.send(message))
    }

    fn close_boxed<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(self.close())
    }
}

/// Type-erased transport for runtime transport selection.
pub struct BoxTransport {
    inner: Box<dyn TransportDyn>,
}

impl BoxTransport {
    /// Wrap a concrete transport in a type-erased box.
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            inner: Box::new(transport),
        }
    }

    /// Send one JSON value.
    pub async fn send(&self, message: Value) -> Result<(), TransportError> {
        self.inner.send_boxed(message).await
    }

    /// Close the transport.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.inner.close_boxed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "connection closed");

        let err = TransportError::Process("spawn failed".to_string());
        assert!(err.to_string().contains("spawn failed"));

        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let err: TransportError = io_err.into();
        assert!(err.to_string().contains("pipe broken"));
    }

    #[tokio::test]
    async fn box_transport_delegates() {
        use serde_json::json;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingTransport {
            sends: Arc<AtomicUsize>,
        }

        impl Transport for CountingTransport {
            async fn send(&self, _message: Value) -> Result<(), TransportError> {
                self.sends.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn close(&self) -> Result<(), TransportError> {
                Ok(())
            }
        }

        let sends = Arc::new(AtomicUsize::new(0));
        let boxed = BoxTransport::new(CountingTransport {
            sends: Arc::clone(&sends),
        });

        boxed.send(json!({ "jsonrpc": "2.0" })).await.unwrap();
        boxed.close().await.unwrap();
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }
}
