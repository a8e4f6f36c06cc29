//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe upstreams
//! - Update upstream health state based on results

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::health::state::{HealthState, Thresholds};
use crate::load_balancer::{UpstreamSelector, UpstreamTarget};
use crate::observability::metrics;

pub struct HealthMonitor {
    selector: Arc<UpstreamSelector>,
    config: HealthCheckConfig,
    client: Client<HttpConnector, Body>,
}

impl HealthMonitor {
    pub fn new(selector: Arc<UpstreamSelector>, config: HealthCheckConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.timeout_secs)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            selector,
            config,
            client,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            path = %self.config.path,
            "Health monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every target once, concurrently.
    pub async fn check_all(&self) {
        let probes = self.selector.targets().iter().map(|target| self.check(target));
        futures_util::future::join_all(probes).await;
    }

    async fn check(&self, target: &UpstreamTarget) {
        let healthy = self.probe(target).await;
        let thresholds = Thresholds::from(&self.config);

        match target.record_probe(healthy, thresholds) {
            Some(HealthState::Unhealthy) => {
                tracing::warn!(upstream = %target.name, "Upstream became unhealthy")
            }
            Some(HealthState::Healthy) => {
                tracing::info!(upstream = %target.name, "Upstream became healthy")
            }
            _ => {}
        }

        metrics::record_upstream_health(&target.name, target.health() != HealthState::Unhealthy);
    }

    async fn probe(&self, target: &UpstreamTarget) -> bool {
        let uri = match target.http_uri(&self.config.path) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(upstream = %target.name, error = %e, "Failed to build health check uri");
                return false;
            }
        };

        let request = match Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::USER_AGENT, "openwebui-proxy-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(upstream = %target.name, error = %e, "Failed to build health check request");
                return false;
            }
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let success = response.status().is_success();
                if !success {
                    tracing::debug!(upstream = %target.name, status = %response.status(), "Health check failed: non-success status");
                }
                success
            }
            Ok(Err(e)) => {
                tracing::debug!(upstream = %target.name, error = %e, "Health check failed: connection error");
                false
            }
            Err(_) => {
                tracing::debug!(upstream = %target.name, "Health check failed: timeout");
                false
            }
        }
    }
}
