//! Runtime error taxonomy.
//!
//! Every failure a request or session can hit maps to one `ProxyError`
//! variant. Each variant knows its client-visible status code and its metric
//! category, so handlers only ever need `?` and `into_response()`.

use std::fmt;
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Which phase of an upstream exchange ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// TCP connect (or WebSocket handshake) did not complete.
    Connect,
    /// Connected, but response headers never arrived.
    Response,
    /// Response started, then the body went quiet.
    Body,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connect => write!(f, "connect"),
            TimeoutPhase::Response => write!(f, "response"),
            TimeoutPhase::Body => write!(f, "body"),
        }
    }
}

/// Errors surfaced by the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("no upstream available")]
    NoUpstreamAvailable,

    #[error("upstream timed out ({phase})")]
    UpstreamTimeout { phase: TimeoutPhase },

    #[error("upstream error: {reason}")]
    UpstreamError { reason: String, connect: bool },

    #[error("slow consumer on {0}")]
    SlowConsumer(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("no matching route")]
    RouteNotFound,

    #[error("proxy is shutting down")]
    ShuttingDown,

    #[error("session limit reached")]
    SessionLimit,
}

/// Metric category of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthorized,
    RateLimited,
    NoUpstream,
    UpstreamTimeout,
    UpstreamError,
    SlowConsumer,
    ProtocolViolation,
    BadRequest,
    Unavailable,
}

impl ErrorKind {
    pub const COUNT: usize = 9;

    pub const ALL: [ErrorKind; Self::COUNT] = [
        ErrorKind::Unauthorized,
        ErrorKind::RateLimited,
        ErrorKind::NoUpstream,
        ErrorKind::UpstreamTimeout,
        ErrorKind::UpstreamError,
        ErrorKind::SlowConsumer,
        ErrorKind::ProtocolViolation,
        ErrorKind::BadRequest,
        ErrorKind::Unavailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NoUpstream => "no_upstream",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::SlowConsumer => "slow_consumer",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unavailable => "unavailable",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Unauthorized => ErrorKind::Unauthorized,
            ProxyError::RateLimited { .. } => ErrorKind::RateLimited,
            ProxyError::NoUpstreamAvailable => ErrorKind::NoUpstream,
            ProxyError::UpstreamTimeout { .. } => ErrorKind::UpstreamTimeout,
            ProxyError::UpstreamError { .. } => ErrorKind::UpstreamError,
            ProxyError::SlowConsumer(_) => ErrorKind::SlowConsumer,
            ProxyError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            ProxyError::BadRequest(_) | ProxyError::PayloadTooLarge | ProxyError::RouteNotFound => {
                ErrorKind::BadRequest
            }
            ProxyError::ShuttingDown | ProxyError::SessionLimit => ErrorKind::Unavailable,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::NoUpstreamAvailable
            | ProxyError::ShuttingDown
            | ProxyError::SessionLimit => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::SlowConsumer(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ProtocolViolation(_) | ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
        }
    }

    /// True for failures that happened before the upstream saw the request.
    /// Only these are safe to retry against another target.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamError { connect: true, .. }
                | ProxyError::UpstreamTimeout { phase: TimeoutPhase::Connect }
        )
    }

    /// Message shown to clients. Upstream details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ProxyError::Unauthorized => "invalid or missing API key".to_string(),
            ProxyError::RateLimited { .. } => "rate limit exceeded".to_string(),
            ProxyError::NoUpstreamAvailable => "no upstream available".to_string(),
            ProxyError::UpstreamTimeout { .. } => "upstream timed out".to_string(),
            ProxyError::UpstreamError { .. } => "upstream request failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Whole seconds for a `Retry-After` header, rounded up, at least 1.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "type": self.kind().as_str(),
            }
        }));
        let mut response = (self.status(), body).into_response();

        if let ProxyError::RateLimited { retry_after } = &self {
            let secs = retry_after_secs(*retry_after);
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(59_001)), 60);
        assert_eq!(retry_after_secs(Duration::from_secs(42)), 42);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[test]
    fn rate_limited_response_has_retry_after() {
        let response = ProxyError::RateLimited {
            retry_after: Duration::from_secs(30),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }

    #[test]
    fn connection_level_classification() {
        assert!(ProxyError::UpstreamError { reason: "refused".into(), connect: true }.is_connection_level());
        assert!(ProxyError::UpstreamTimeout { phase: TimeoutPhase::Connect }.is_connection_level());
        assert!(!ProxyError::UpstreamTimeout { phase: TimeoutPhase::Response }.is_connection_level());
        assert!(!ProxyError::UpstreamError { reason: "reset".into(), connect: false }.is_connection_level());
    }
}
