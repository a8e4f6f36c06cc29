//! Upstream target abstraction.
//!
//! # Responsibilities
//! - Represent a single model server
//! - Track probe health and reactive cooldown
//! - Build upstream URIs for HTTP and WebSocket traffic

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::http::Uri;
use serde::Serialize;
use url::Url;

use crate::error::ProxyError;
use crate::health::state::{HealthCell, HealthState, Thresholds};

/// A single upstream model server.
#[derive(Debug)]
pub struct UpstreamTarget {
    pub name: String,
    /// Base URL without a trailing slash. May carry a path prefix.
    base: String,
    /// Same base with a `ws` scheme.
    ws_base: String,
    authority: String,
    health: HealthCell,
    /// Millis since `epoch` until which the target sits out. 0 = not cooling down.
    cooldown_until_ms: AtomicU64,
    last_checked_unix: AtomicU64,
    epoch: Instant,
}

/// Point-in-time view for `/health` and `/admin/upstreams`.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub target: String,
    pub url: String,
    pub healthy: bool,
    pub state: HealthState,
    pub cooling_down: bool,
    pub last_checked: Option<u64>,
}

impl UpstreamTarget {
    pub fn new(name: impl Into<String>, url: &str) -> Result<Self, url::ParseError> {
        let parsed = Url::parse(url)?;
        let host = parsed.host_str().ok_or(url::ParseError::EmptyHost)?;
        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = parsed.path().trim_end_matches('/');
        let base = format!("{}://{authority}{path}", parsed.scheme());
        let ws_scheme = if parsed.scheme() == "https" { "wss" } else { "ws" };
        let ws_base = format!("{ws_scheme}://{authority}{path}");

        Ok(Self {
            name: name.into(),
            base,
            ws_base,
            authority,
            health: HealthCell::new(),
            cooldown_until_ms: AtomicU64::new(0),
            last_checked_unix: AtomicU64::new(0),
            epoch: Instant::now(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Upstream URI for an inbound `path_and_query`.
    pub fn http_uri(&self, path_and_query: &str) -> Result<Uri, ProxyError> {
        format!("{}{}", self.base, path_and_query)
            .parse()
            .map_err(|e| ProxyError::BadRequest(format!("invalid upstream uri: {e}")))
    }

    /// Upstream WebSocket URL for an inbound `path_and_query`.
    pub fn ws_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.ws_base, path_and_query)
    }

    // --- Health Logic ---

    pub fn health(&self) -> HealthState {
        self.health.get()
    }

    /// Apply one probe result.
    pub fn record_probe(&self, success: bool, thresholds: Thresholds) -> Option<HealthState> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.last_checked_unix.store(now, Ordering::Relaxed);

        let changed = self.health.record(success, thresholds);
        if success {
            self.cooldown_until_ms.store(0, Ordering::Release);
        }
        changed
    }

    fn millis(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Take the target out of rotation for `cooldown` after a forwarding failure.
    pub fn mark_failed(&self, cooldown: Duration, now: Instant) {
        let until = self.millis(now + cooldown).max(1);
        self.cooldown_until_ms.fetch_max(until, Ordering::AcqRel);
        tracing::warn!(upstream = %self.name, cooldown_secs = cooldown.as_secs(), "Upstream marked failed");
    }

    pub fn is_cooling_down(&self, now: Instant) -> bool {
        let until = self.cooldown_until_ms.load(Ordering::Acquire);
        until != 0 && self.millis(now) < until
    }

    /// Healthy or unknown, and not cooling down.
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.health() != HealthState::Unhealthy && !self.is_cooling_down(now)
    }

    pub fn snapshot(&self, now: Instant) -> TargetSnapshot {
        let last = self.last_checked_unix.load(Ordering::Relaxed);
        TargetSnapshot {
            target: self.name.clone(),
            url: self.base.clone(),
            healthy: self.is_eligible(now),
            state: self.health(),
            cooling_down: self.is_cooling_down(now),
            last_checked: (last != 0).then_some(last),
        }
    }
}
