//! Retry policy.
//!
//! # Responsibilities
//! - Determine if a request may be replayed (safe methods only)
//! - Determine if a failure may be retried (connection-level only)
//!
//! # Design Decisions
//! - Never retry POST/PUT/DELETE/PATCH
//! - At most one retry, against a different upstream
//! - Anything the upstream may have seen is never retried

use axum::http::Method;

use crate::config::RetryConfig;
use crate::error::ProxyError;

/// Maximum attempts for one request, including the first.
pub const MAX_ATTEMPTS: u32 = 2;

pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Whether attempt number `attempt` (1-based) that failed with `error` may be retried.
pub fn should_retry(config: &RetryConfig, method: &Method, error: &ProxyError, attempt: u32) -> bool {
    config.enabled && attempt < MAX_ATTEMPTS && is_idempotent(method) && error.is_connection_level()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutPhase;

    fn refused() -> ProxyError {
        ProxyError::UpstreamError {
            reason: "connection refused".into(),
            connect: true,
        }
    }

    #[test]
    fn retries_idempotent_connection_failures_once() {
        let config = RetryConfig::default();
        assert!(should_retry(&config, &Method::GET, &refused(), 1));
        assert!(!should_retry(&config, &Method::GET, &refused(), 2));
    }

    #[test]
    fn never_retries_non_idempotent() {
        let config = RetryConfig::default();
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            assert!(!should_retry(&config, &method, &refused(), 1));
        }
    }

    #[test]
    fn never_retries_after_request_was_sent() {
        let config = RetryConfig::default();
        let timeout = ProxyError::UpstreamTimeout {
            phase: TimeoutPhase::Response,
        };
        assert!(!should_retry(&config, &Method::GET, &timeout, 1));

        let disabled = RetryConfig {
            enabled: false,
            ..RetryConfig::default()
        };
        assert!(!should_retry(&disabled, &Method::GET, &refused(), 1));
    }
}
