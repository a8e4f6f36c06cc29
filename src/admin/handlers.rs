use std::time::Instant;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::http::server::AppState;
use crate::load_balancer::TargetSnapshot;
use crate::net::ProxySession;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub active_sessions: usize,
    pub upstreams: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if state.sessions.is_draining() { "draining" } else { "operational" },
        active_sessions: state.sessions.active_count(),
        upstreams: state.selector.targets().len(),
    })
}

pub async fn get_sessions(State(state): State<AppState>) -> Json<Vec<ProxySession>> {
    Json(state.sessions.list_active())
}

pub async fn get_upstreams(State(state): State<AppState>) -> Json<Vec<TargetSnapshot>> {
    let now = Instant::now();
    Json(state.selector.targets().iter().map(|t| t.snapshot(now)).collect())
}
