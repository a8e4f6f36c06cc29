//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metric events (admissions, rejections, forwards, sessions)
//! - Aggregate them into lock-free counters for `GET /metrics`
//! - Mirror them into the `metrics` facade for the Prometheus exporter
//!
//! # Metrics
//! - `proxy_admitted_total` (counter)
//! - `proxy_rejected_total` (counter): by `reason` (auth, rate_limit)
//! - `proxy_forwarded_total` (counter): by `upstream`, `status`
//! - `proxy_errors_total` (counter): by `kind`
//! - `proxy_sessions_opened_total` / `proxy_sessions_closed_total` (counter): by `protocol`
//! - `proxy_upstream_health` (gauge): 1=healthy, 0=unhealthy
//!
//! # Design Decisions
//! - Hot path only touches atomics; the per-identity map takes a shard
//!   read lock, never a lock shared with forwarding
//! - Snapshots are plain values, never live views

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;

use crate::error::ErrorKind;
use crate::net::session::Protocol;

/// An observable occurrence reported by any component.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    Admitted { key_id: String },
    RejectedAuth,
    RejectedRateLimit { key_id: String },
    Forwarded { key_id: String, upstream: String, status: u16 },
    SessionOpened { protocol: Protocol },
    SessionClosed { protocol: Protocol },
    Error { kind: ErrorKind, key_id: Option<String> },
}

#[derive(Debug, Default)]
struct IdentityCounters {
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    forwarded: AtomicU64,
    errors: AtomicU64,
}

/// Aggregates `MetricEvent`s into counters.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    admitted: AtomicU64,
    rejected_auth: AtomicU64,
    rejected_rate_limit: AtomicU64,
    forwarded: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    errors: [AtomicU64; ErrorKind::COUNT],
    identities: DashMap<String, Arc<IdentityCounters>>,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub rejected_auth: u64,
    pub rejected_rate_limit: u64,
    pub forwarded: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub errors: std::collections::BTreeMap<&'static str, u64>,
    pub identities: std::collections::BTreeMap<String, IdentitySnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySnapshot {
    pub admitted: u64,
    pub rate_limited: u64,
    pub forwarded: u64,
    pub errors: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event.
    pub fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::Admitted { key_id } => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                self.identity(&key_id).admitted.fetch_add(1, Ordering::Relaxed);
                counter!("proxy_admitted_total").increment(1);
            }
            MetricEvent::RejectedAuth => {
                self.rejected_auth.fetch_add(1, Ordering::Relaxed);
                counter!("proxy_rejected_total", "reason" => "auth").increment(1);
            }
            MetricEvent::RejectedRateLimit { key_id } => {
                self.rejected_rate_limit.fetch_add(1, Ordering::Relaxed);
                self.identity(&key_id).rate_limited.fetch_add(1, Ordering::Relaxed);
                counter!("proxy_rejected_total", "reason" => "rate_limit").increment(1);
            }
            MetricEvent::Forwarded { key_id, upstream, status } => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                self.identity(&key_id).forwarded.fetch_add(1, Ordering::Relaxed);
                counter!(
                    "proxy_forwarded_total",
                    "upstream" => upstream,
                    "status" => status.to_string()
                )
                .increment(1);
            }
            MetricEvent::SessionOpened { protocol } => {
                self.sessions_opened.fetch_add(1, Ordering::Relaxed);
                counter!("proxy_sessions_opened_total", "protocol" => protocol.as_str()).increment(1);
            }
            MetricEvent::SessionClosed { protocol } => {
                self.sessions_closed.fetch_add(1, Ordering::Relaxed);
                counter!("proxy_sessions_closed_total", "protocol" => protocol.as_str()).increment(1);
            }
            MetricEvent::Error { kind, key_id } => {
                self.errors[kind.index()].fetch_add(1, Ordering::Relaxed);
                if let Some(key_id) = key_id {
                    self.identity(&key_id).errors.fetch_add(1, Ordering::Relaxed);
                }
                counter!("proxy_errors_total", "kind" => kind.as_str()).increment(1);
            }
        }
    }

    fn identity(&self, key_id: &str) -> Arc<IdentityCounters> {
        if let Some(existing) = self.identities.get(key_id) {
            return Arc::clone(existing.value());
        }
        let entry = self.identities.entry(key_id.to_string()).or_default();
        Arc::clone(entry.value())
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = ErrorKind::ALL
            .iter()
            .map(|kind| (kind.as_str(), self.errors[kind.index()].load(Ordering::Relaxed)))
            .collect();

        let identities = self
            .identities
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    entry.key().clone(),
                    IdentitySnapshot {
                        admitted: c.admitted.load(Ordering::Relaxed),
                        rate_limited: c.rate_limited.load(Ordering::Relaxed),
                        forwarded: c.forwarded.load(Ordering::Relaxed),
                        errors: c.errors.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_auth: self.rejected_auth.load(Ordering::Relaxed),
            rejected_rate_limit: self.rejected_rate_limit.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            errors,
            identities,
        }
    }
}

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

/// Publish an upstream's health as a gauge.
pub fn record_upstream_health(upstream: &str, healthy: bool) {
    gauge!("proxy_upstream_health", "upstream" => upstream.to_string()).set(if healthy { 1.0 } else { 0.0 });
}

/// Publish the number of live sessions.
pub fn record_active_sessions(count: usize) {
    gauge!("proxy_active_sessions").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_category_and_identity() {
        let metrics = MetricsCollector::new();
        metrics.record(MetricEvent::Admitted { key_id: "abc".into() });
        metrics.record(MetricEvent::Admitted { key_id: "abc".into() });
        metrics.record(MetricEvent::RejectedAuth);
        metrics.record(MetricEvent::RejectedRateLimit { key_id: "abc".into() });
        metrics.record(MetricEvent::Error {
            kind: ErrorKind::UpstreamTimeout,
            key_id: Some("abc".into()),
        });

        let snap = metrics.snapshot();
        assert_eq!(snap.admitted, 2);
        assert_eq!(snap.rejected_auth, 1);
        assert_eq!(snap.rejected_rate_limit, 1);
        assert_eq!(snap.errors["upstream_timeout"], 1);
        assert_eq!(snap.errors["upstream_error"], 0);

        let abc = &snap.identities["abc"];
        assert_eq!(abc.admitted, 2);
        assert_eq!(abc.rate_limited, 1);
        assert_eq!(abc.errors, 1);
    }
}
