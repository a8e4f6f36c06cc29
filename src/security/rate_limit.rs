//! Per-identity fixed-window rate limiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use crate::config::{RateLimitConfig, TierConfig};
use crate::error::{retry_after_secs, ProxyError};
use crate::observability::{MetricEvent, MetricsCollector};
use crate::security::credentials::Identity;

/// One identity's budget in the current window.
#[derive(Debug, Clone, Copy)]
struct RateBudget {
    window_start: Instant,
    consumed: u32,
    limit: u32,
    window: Duration,
}

impl RateBudget {
    fn fresh(tier: TierConfig, now: Instant) -> Self {
        Self {
            window_start: now,
            consumed: 0,
            limit: tier.limit,
            window: Duration::from_secs(tier.window_secs),
        }
    }

    /// `now` earlier than `window_start` (clock went backwards) keeps the
    /// current window.
    fn elapsed(&self, now: Instant) -> bool {
        now.checked_duration_since(self.window_start)
            .is_some_and(|since| since >= self.window)
    }

    fn reset_after(&self, now: Instant) -> Duration {
        (self.window_start + self.window).saturating_duration_since(now)
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

pub struct RateLimiter {
    budgets: DashMap<String, RateBudget>,
    tiers: HashMap<String, TierConfig>,
    default_tier: String,
    enabled: bool,
    metrics: Arc<MetricsCollector>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            budgets: DashMap::new(),
            tiers: config.tiers.clone(),
            default_tier: config.default_tier.clone(),
            enabled: config.enabled,
            metrics,
        }
    }

    fn tier(&self, name: &str) -> TierConfig {
        self.tiers
            .get(name)
            .or_else(|| self.tiers.get(&self.default_tier))
            .copied()
            .unwrap_or(TierConfig {
                limit: 60,
                window_secs: 60,
            })
    }

    /// Consume one unit of `identity`'s budget.
    ///
    /// The check and the increment happen under the entry's shard lock, so
    /// concurrent callers can never admit more than `limit` per window.
    pub fn admit(&self, identity: &Identity, now: Instant) -> Result<Admitted, ProxyError> {
        let tier = self.tier(&identity.tier);
        if !self.enabled {
            return Ok(Admitted {
                limit: tier.limit,
                remaining: tier.limit,
                reset_after: Duration::ZERO,
            });
        }

        let mut budget = self
            .budgets
            .entry(identity.key_id.clone())
            .or_insert_with(|| RateBudget::fresh(tier, now));

        if budget.elapsed(now) {
            *budget = RateBudget::fresh(tier, now);
        }

        if budget.consumed < budget.limit {
            budget.consumed += 1;
            let admitted = Admitted {
                limit: budget.limit,
                remaining: budget.limit - budget.consumed,
                reset_after: budget.reset_after(now),
            };
            drop(budget);
            self.metrics.record(MetricEvent::Admitted {
                key_id: identity.key_id.clone(),
            });
            Ok(admitted)
        } else {
            let retry_after = budget.reset_after(now);
            drop(budget);
            tracing::warn!(
                key_id = %identity.key_id,
                tier = %identity.tier,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
            self.metrics.record(MetricEvent::RejectedRateLimit {
                key_id: identity.key_id.clone(),
            });
            Err(ProxyError::RateLimited { retry_after })
        }
    }

    /// Drop budgets whose window has elapsed. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.budgets.len();
        self.budgets.retain(|_, budget| !budget.elapsed(now));
        let removed = before.saturating_sub(self.budgets.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept idle rate budgets");
        }
        removed
    }

    pub fn tracked(&self) -> usize {
        self.budgets.len()
    }
}

/// Admits requests carrying an authenticated `Identity`.
///
/// Runs after the credential middleware. A missing identity is treated as
/// unauthenticated.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(identity) = request.extensions().get::<Identity>().cloned() else {
        return ProxyError::Unauthorized.into_response();
    };

    match limiter.admit(&identity, Instant::now()) {
        Ok(admitted) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(admitted.limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(admitted.remaining));
            headers.insert(
                "x-ratelimit-reset",
                HeaderValue::from(retry_after_secs(admitted.reset_after)),
            );
            response
        }
        Err(e) => e.into_response(),
    }
}
