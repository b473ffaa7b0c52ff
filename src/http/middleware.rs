//! Rate limiting middleware for axum.
//!
//! Each guarded route gets an [`OperationGuard`] holding the limiter for its
//! operation. Rate limit status is reported in HTTP headers:
//! - `x-ratelimit-limit`: admissions allowed per window
//! - `x-ratelimit-remaining`: admissions left in the current window
//! - `retry-after`: whole seconds until the window resets (429 only)

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, warn};

use crate::ratelimit::{Clock, RateLimitStatus, RateLimiter};

/// Standard rate limit header names.
pub mod headers {
    use super::HeaderName;

    /// Maximum admissions per window.
    pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
    /// Admissions left in the current window.
    pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
}

/// Middleware state: the limiter for one operation and the time source.
#[derive(Clone)]
pub struct OperationGuard {
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl OperationGuard {
    /// Create a guard for a limiter.
    pub fn new(limiter: Arc<RateLimiter>, clock: Arc<dyn Clock>) -> Self {
        Self { limiter, clock }
    }

    /// The operation this guard protects.
    pub fn operation(&self) -> &str {
        self.limiter.name()
    }
}

/// Admit or reject a request before it reaches the protected handler.
///
/// - Admitted requests run and get rate limit headers added
/// - Rejected requests get `429 Too Many Requests`
/// - Requests with no usable identity get `400 Bad Request`
pub async fn rate_limit_middleware(
    State(guard): State<OperationGuard>,
    request: Request,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let result = guard
        .limiter
        .check(request.headers(), remote_addr, guard.clock.now())
        .await;

    match result {
        Ok(status) if status.is_admitted() => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(&mut response, &status);
            response
        }
        Ok(status) => {
            debug!(
                operation = guard.operation(),
                method = %request.method(),
                path = %request.uri().path(),
                "Request rate limited"
            );
            rate_limit_response(&status)
        }
        Err(e) => {
            warn!(operation = guard.operation(), error = %e, "Rejecting request without identity");
            invalid_identity_response()
        }
    }
}

/// Create a 429 Too Many Requests response.
fn rate_limit_response(status: &RateLimitStatus) -> Response {
    let retry_after_ms = status.retry_after.as_millis() as u64;
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "error": "Too many requests",
            "code": "RATE_LIMIT_EXCEEDED",
            "retry_after_ms": retry_after_ms
        })),
    )
        .into_response();

    add_rate_limit_headers(&mut response, status);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_ms.div_ceil(1000)));
    response
}

/// Create a 400 response for requests that carry no identity.
fn invalid_identity_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": "Unable to identify caller",
            "code": "INVALID_IDENTITY"
        })),
    )
        .into_response()
}

fn add_rate_limit_headers(response: &mut Response, status: &RateLimitStatus) {
    let map = response.headers_mut();
    map.insert(headers::X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit));
    map.insert(headers::X_RATELIMIT_REMAINING.clone(), HeaderValue::from(status.remaining));
}
