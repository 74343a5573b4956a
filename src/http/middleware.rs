//! Admission middleware.
//!
//! Extracts the caller's identity, asks the [`RateLimiter`] for a decision,
//! and renders it as rate limit headers:
//! - `X-RateLimit-Limit`: quota for this identity
//! - `X-RateLimit-Remaining`: requests left in the current window
//! - `X-RateLimit-Reset`: Unix timestamp when capacity returns
//! - `Retry-After`: seconds to wait (429 responses only)

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, error, instrument};

use crate::ratelimit::{Decision, RateLimiter};
use crate::storage::OpContext;

/// Dedicated token header, checked before `Authorization`.
pub const API_KEY_HEADER: &str = "api_key";

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Shared state for [`admission_middleware`].
#[derive(Clone)]
pub struct AdmissionState {
    pub limiter: Arc<RateLimiter>,
    /// Prefer the first `X-Forwarded-For` entry over the socket address
    pub trust_forwarded_for: bool,
}

/// Check every request against the rate limiter before it reaches a handler.
///
/// Denied requests get a 429, engine failures a 500; anything else passes
/// through with the rate limit headers added.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(
        request.headers(),
        connect_info.as_ref(),
        state.trust_forwarded_for,
    );
    let token = extract_token(request.headers());

    let ctx = OpContext::with_timeout(state.limiter.storage_timeout());
    let decision = match state.limiter.check(&ctx, &ip, &token).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(error = %e, "Rate limit check failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": e.to_string(),
                    "message": "Internal Server Error",
                })),
            )
                .into_response();
        }
    };

    if !decision.allowed {
        let retry_after = retry_after_secs(&decision, &state.limiter);
        debug!(limit = decision.limit, retry_after = retry_after, "Request denied");

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Rate Limit Exceeded",
                "message": decision.reason,
                "retry_after_seconds": retry_after,
            })),
        )
            .into_response();
        add_rate_limit_headers(response.headers_mut(), &decision);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let mut response = next.run(request).await;
    add_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(decision.reset_time.timestamp()),
    );
}

/// Whole seconds until the decision resets, rounded up.
fn retry_after_secs(decision: &Decision, limiter: &RateLimiter) -> u64 {
    let wait = decision.retry_after(limiter.now());
    wait.as_secs()
        .saturating_add(u64::from(wait.subsec_nanos() > 0))
}

/// Token from the `API_KEY` header, else from `Authorization: Bearer`.
///
/// Returns an empty string when the request carries no token.
pub fn extract_token(headers: &HeaderMap) -> String {
    let header_str = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(token) = header_str(API_KEY_HEADER) {
        return token.to_string();
    }

    header_str(header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

/// Client address for the request.
///
/// Order of precedence:
/// 1. First `X-Forwarded-For` entry, only when trusted
/// 2. `ConnectInfo` socket address
pub fn client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    connect_info
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
