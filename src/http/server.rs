//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::router;
use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimiter;

/// HTTP server fronted by the admission middleware.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            limiter,
            trust_forwarded_for: false,
        }
    }

    /// Take the client address from `X-Forwarded-For` when the header is present.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Start the server with graceful shutdown.
    ///
    /// In-flight requests finish after `signal` resolves; new connections
    /// are refused.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(
            addr = %self.addr,
            backend = self.limiter.storage_name(),
            trust_forwarded_for = self.trust_forwarded_for,
            "Starting HTTP server"
        );

        let app = router(self.limiter, self.trust_forwarded_for);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}
