//! HTTP surface: the admission middleware and the server that hosts it.

mod middleware;
mod server;

use std::sync::Arc;

use axum::{middleware::from_fn_with_state, routing::get, Router};

pub use middleware::{admission_middleware, client_ip, extract_token, AdmissionState, API_KEY_HEADER};
pub use server::HttpServer;

use crate::ratelimit::RateLimiter;

/// Build the application router with every route behind the rate limiter.
pub fn router(limiter: Arc<RateLimiter>, trust_forwarded_for: bool) -> Router {
    let state = AdmissionState {
        limiter,
        trust_forwarded_for,
    };

    Router::new()
        .route("/ping", get(ping))
        .layer(from_fn_with_state(state, admission_middleware))
}

async fn ping() -> &'static str {
    "pong"
}
