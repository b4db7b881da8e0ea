//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::routes::router;
use crate::error::{Result, TrafficGateError};
use crate::ratelimit::AdmissionBackend;

/// HTTP server for the rate-limited API.
pub struct HttpServer<R: AdmissionBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission backend
    backend: Arc<R>,
}

impl<R: AdmissionBackend + 'static> HttpServer<R> {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, backend: Arc<R>) -> Self {
        Self { addr, backend }
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves and returns once in-flight requests have completed.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %listener.local_addr()?, "Starting HTTP server");

        axum::serve(listener, router(self.backend))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TrafficGateError::Http(e.to_string())
            })
    }
}
