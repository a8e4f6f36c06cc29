//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe forwarding outcomes
//! - Put failing upstreams on cooldown
//!
//! # Design Decisions
//! - Only connection errors, timeouts and 502/503/504 count as failures
//! - 4xx are NOT failures (client error, not upstream)

use std::time::Instant;

use axum::http::StatusCode;

use crate::error::ProxyError;
use crate::load_balancer::{UpstreamSelector, UpstreamTarget};

/// Whether an error says something about the upstream's health.
pub fn is_upstream_failure(error: &ProxyError) -> bool {
    matches!(
        error,
        ProxyError::UpstreamError { .. } | ProxyError::UpstreamTimeout { .. }
    )
}

/// Whether an upstream status says it cannot serve right now.
pub fn is_failure_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Feed a forwarding error back into selection.
pub fn observe_error(selector: &UpstreamSelector, target: &UpstreamTarget, error: &ProxyError) {
    if is_upstream_failure(error) {
        selector.report_failure(target, Instant::now());
    }
}

/// Feed a received status back into selection.
pub fn observe_status(selector: &UpstreamSelector, target: &UpstreamTarget, status: StatusCode) {
    if is_failure_status(status) {
        selector.report_failure(target, Instant::now());
    }
}
