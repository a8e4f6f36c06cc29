//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with all handlers
//! - Wire up middleware (request ID, tracing, credential gate, rate limit)
//! - Dispatch proxied traffic to the forwarder or the WebSocket relay
//! - Run background tasks (active health checks, budget sweeps)
//! - Serve plain or TLS, and drain sessions on shutdown
//!
//! # Layer order (outermost first)
//! ```text
//! SetRequestId → Trace → PropagateRequestId
//!     → /health, /metrics, /admin/*        (no credential gate)
//!     → fallback: access control → rate limit → proxy_handler
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, ConnectInfo, FromRequestParts, State},
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin;
use crate::config::{ConfigError, ProxyConfig};
use crate::error::ProxyError;
use crate::health::HealthMonitor;
use crate::lifecycle::Shutdown;
use crate::load_balancer::UpstreamSelector;
use crate::net::tls::load_tls_config;
use crate::net::{Protocol, SessionInfo, SessionRegistry};
use crate::observability::{MetricEvent, MetricsCollector};
use crate::routing::RouteTable;
use crate::security::access_control::{access_control_middleware, AccessControlState};
use crate::security::rate_limit::rate_limit_middleware;
use crate::security::{CredentialGate, CredentialSet, CredentialStore, Identity, RateLimiter, ReloadableCredentials};

use super::endpoints;
use super::forward::{Caller, Forwarder};
use super::request::{is_websocket_upgrade, make_span, request_id, MakeRequestUuid};
use super::websocket::{self, UpgradeRequest};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub selector: Arc<UpstreamSelector>,
    pub routes: Arc<RouteTable>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<MetricsCollector>,
    pub forwarder: Arc<Forwarder>,
}

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    state: AppState,
    credentials: Arc<ReloadableCredentials>,
    limiter: Arc<RateLimiter>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        let config = Arc::new(config);
        let metrics = Arc::new(MetricsCollector::new());
        let selector = Arc::new(UpstreamSelector::new(&config.upstreams, &config.selection)?);
        let sessions = Arc::new(SessionRegistry::new(config.sessions.max_sessions, Arc::clone(&metrics)));
        let forwarder = Arc::new(Forwarder::new(&config, Arc::clone(&selector), Arc::clone(&metrics)));

        let credentials = Arc::new(ReloadableCredentials::new(CredentialSet::from_config(
            &config.auth,
            &config.rate_limit,
        )));
        let store: Arc<dyn CredentialStore> = credentials.clone();
        let gate = Arc::new(CredentialGate::new(store, Arc::clone(&metrics)));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, Arc::clone(&metrics)));

        let state = AppState {
            routes: Arc::new(RouteTable::new(&config.routes)),
            config,
            selector,
            sessions,
            metrics,
            forwarder,
        };

        let router = Self::build_router(state.clone(), gate, Arc::clone(&limiter));
        Ok(Self {
            router,
            state,
            credentials,
            limiter,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState, gate: Arc<CredentialGate>, limiter: Arc<RateLimiter>) -> Router {
        let access = AccessControlState {
            gate,
            auth: Arc::new(state.config.auth.clone()),
        };

        let proxied = Router::new()
            .fallback(proxy_handler)
            .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
            .layer(middleware::from_fn_with_state(access, access_control_middleware))
            .with_state(state.clone());

        let mut router = Router::new()
            .route("/health", get(endpoints::health))
            .route("/metrics", get(endpoints::metrics))
            .with_state(state.clone());

        if state.config.admin.enabled {
            router = router.merge(admin::router(state));
        }

        router.fallback_service(proxied).layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
    }

    /// The router, for serving on a custom transport or driving in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Apply reloaded configurations' credential sets as they arrive.
    pub fn watch_credentials(&self, mut updates: mpsc::UnboundedReceiver<ProxyConfig>) {
        let credentials = Arc::clone(&self.credentials);
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                credentials.replace(CredentialSet::from_config(&config.auth, &config.rate_limit));
            }
        });
    }

    fn spawn_background(&self, shutdown: &Shutdown) {
        let config = &self.state.config;

        if config.health_check.enabled {
            let monitor = HealthMonitor::new(Arc::clone(&self.state.selector), config.health_check.clone());
            tokio::spawn(monitor.run(shutdown.subscribe()));
        }

        let limiter = Arc::clone(&self.limiter);
        let every = std::time::Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1));
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.sweep(Instant::now());
                    }
                    _ = stop.recv() => break,
                }
            }
        });
    }

    /// Run the server until `shutdown` fires, then drain live sessions.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), io::Error> {
        let addr = listener.local_addr()?;
        let config = Arc::clone(&self.state.config);
        let grace = config.timeouts.drain_grace();
        let hard_stop = grace + config.timeouts.close_grace();

        self.spawn_background(&shutdown);

        let sessions = Arc::clone(&self.state.sessions);
        let drain_signal = shutdown.clone();
        let drain = tokio::spawn(async move {
            drain_signal.signalled().await;
            tracing::info!(active = sessions.active_count(), grace = ?grace, "Draining sessions");
            sessions.begin_drain();
            sessions.drain(grace).await
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        match &config.listener.tls {
            Some(tls) => {
                let rustls = load_tls_config(tls).await?;
                let handle = axum_server::Handle::new();
                let stop = shutdown.clone();
                let stopper = handle.clone();
                tokio::spawn(async move {
                    stop.signalled().await;
                    stopper.graceful_shutdown(Some(hard_stop));
                });

                tracing::info!(address = %addr, "HTTPS server starting");
                axum_server::from_tcp_rustls(listener.into_std()?, rustls)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
            None => {
                tracing::info!(address = %addr, "HTTP server starting");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.signalled().await })
                    .await?;
            }
        }

        let forced = drain.await.unwrap_or_default();
        if forced > 0 {
            tracing::warn!(forced, "Sessions force-closed after drain grace");
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Entry point for everything that passed the credential gate.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = request_id(request.headers());
    let Some(identity) = request.extensions().get::<Identity>().cloned() else {
        return ProxyError::Unauthorized.into_response();
    };
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let (mut parts, body) = request.into_parts();

    let route = match state.routes.lookup(&parts) {
        Ok(route) => route,
        Err(e) => return fail(&state, e, &identity, &request_id),
    };

    let websocket = is_websocket_upgrade(&parts.headers);
    let session = match state.sessions.register(SessionInfo {
        protocol: if websocket { Protocol::WebSocket } else { Protocol::Http },
        key_id: identity.key_id.clone(),
        client_addr,
        path: parts.uri.path().to_string(),
    }) {
        Ok(session) => session,
        Err(e) => return fail(&state, e, &identity, &request_id),
    };

    tracing::debug!(
        request_id = %request_id,
        session_id = %session.id,
        key_id = %identity.key_id,
        route = ?route.name,
        websocket,
        "Proxying request"
    );

    if websocket {
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        let upgrade = UpgradeRequest {
            headers: parts.headers,
            path_and_query: route.path_and_query,
            client_addr,
            key_id: identity.key_id,
            request_id,
        };
        return websocket::handle_upgrade(state, ws, upgrade, session).await;
    }

    let caller = Caller {
        key_id: identity.key_id.clone(),
        client_addr,
    };
    match state
        .forwarder
        .forward(Request::from_parts(parts, body), &route, &caller, session)
        .await
    {
        Ok(response) => response,
        Err(e) => fail(&state, e, &identity, &request_id),
    }
}

fn fail(state: &AppState, error: ProxyError, identity: &Identity, request_id: &str) -> Response {
    tracing::warn!(
        request_id = %request_id,
        key_id = %identity.key_id,
        status = %error.status(),
        error = %error,
        "Request failed"
    );
    state.metrics.record(MetricEvent::Error {
        kind: error.kind(),
        key_id: Some(identity.key_id.clone()),
    });
    error.into_response()
}
