//! Unauthenticated operational endpoints: `/health` and `/metrics`.

use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::load_balancer::UpstreamSelector;
use crate::observability::MetricsSnapshot;

use super::server::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Serialize)]
pub struct UpstreamHealth {
    pub target: String,
    pub healthy: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: Overall,
    pub upstreams: Vec<UpstreamHealth>,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct MetricsReport {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub active_sessions: usize,
}

/// All targets eligible is ok, some is degraded, none (or draining) is down.
pub fn health_report(selector: &UpstreamSelector, active_sessions: usize, draining: bool, now: Instant) -> HealthReport {
    let upstreams: Vec<_> = selector
        .targets()
        .iter()
        .map(|t| UpstreamHealth {
            target: t.name.clone(),
            healthy: t.is_eligible(now),
        })
        .collect();

    let healthy = upstreams.iter().filter(|u| u.healthy).count();
    let status = if draining || healthy == 0 {
        Overall::Down
    } else if healthy < upstreams.len() {
        Overall::Degraded
    } else {
        Overall::Ok
    };

    HealthReport {
        status,
        upstreams,
        active_sessions,
    }
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = health_report(
        &state.selector,
        state.sessions.active_count(),
        state.sessions.is_draining(),
        Instant::now(),
    );
    let code = match report.status {
        Overall::Down => StatusCode::SERVICE_UNAVAILABLE,
        Overall::Ok | Overall::Degraded => StatusCode::OK,
    };
    (code, Json(report))
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsReport> {
    Json(MetricsReport {
        counters: state.metrics.snapshot(),
        active_sessions: state.sessions.active_count(),
    })
}
