//! HTTP forwarding to the selected upstream.
//!
//! # Responsibilities
//! - Rebuild the inbound request against the chosen upstream
//! - Strip hop-by-hop headers both ways and set `X-Forwarded-*`
//! - Enforce the body size cap, the response deadline and the idle body timeout
//! - Retry connection-level failures of safe methods once, on another upstream
//! - Stream the response back without buffering it
//!
//! # Design Decisions
//! - Request bodies are buffered only when a retry or a body check needs them
//! - Response status, headers and body are passed through untouched
//! - The session guard rides inside the response body so the session lives
//!   exactly as long as the stream

use std::error::Error as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, request::Parts, HeaderValue, Request, Response};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::config::{ProxyConfig, RetryConfig};
use crate::error::{ProxyError, TimeoutPhase};
use crate::health::passive;
use crate::load_balancer::{RequestContext, UpstreamSelector, UpstreamTarget};
use crate::net::session::SessionState;
use crate::net::SessionGuard;
use crate::observability::{MetricEvent, MetricsCollector};
use crate::resilience::backoff::retry_delay;
use crate::resilience::retries::{is_idempotent, should_retry};
use crate::resilience::timeouts::{idle_timeout, with_timeout};
use crate::routing::{require_model, RouteMatch};
use crate::security::headers;

use super::request::{request_id, X_REQUEST_ID};

/// Forwards HTTP requests and streams responses back.
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    selector: Arc<UpstreamSelector>,
    metrics: Arc<MetricsCollector>,
    retries: RetryConfig,
    idle: Duration,
    max_body_size: usize,
}

/// Who is asking, for logs and metrics.
#[derive(Debug, Clone)]
pub struct Caller {
    pub key_id: String,
    pub client_addr: Option<SocketAddr>,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig, selector: Arc<UpstreamSelector>, metrics: Arc<MetricsCollector>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeouts.connect()));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            selector,
            metrics,
            retries: config.retries.clone(),
            idle: config.timeouts.idle(),
            max_body_size: config.security.max_body_size,
        }
    }

    /// Forward `request` along `route` and return the upstream's response.
    pub async fn forward(
        &self,
        request: Request<Body>,
        route: &RouteMatch,
        caller: &Caller,
        session: SessionGuard,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = request.into_parts();
        let request_id = request_id(&parts.headers);

        let sent = self.send(&parts, body, route, caller, &request_id).await;
        let (target, response) = match sent {
            Ok(ok) => ok,
            Err(e) => {
                session.state.advance(SessionState::Failed);
                return Err(e);
            }
        };

        let status = response.status();
        session.bind_upstream(&target.name);
        session.state.advance(SessionState::Relaying);
        self.metrics.record(MetricEvent::Forwarded {
            key_id: caller.key_id.clone(),
            upstream: target.name.clone(),
            status: status.as_u16(),
        });
        tracing::debug!(
            request_id = %request_id,
            session_id = %session.id,
            upstream = %target.name,
            status = %status,
            "Upstream responded"
        );

        let (mut head, incoming) = response.into_parts();
        headers::strip_hop_by_hop(&mut head.headers);
        let body = self.stream_body(incoming, target, session, caller.key_id.clone());
        Ok(Response::from_parts(head, body))
    }

    async fn send(
        &self,
        parts: &Parts,
        body: Body,
        route: &RouteMatch,
        caller: &Caller,
        request_id: &str,
    ) -> Result<(Arc<UpstreamTarget>, Response<Incoming>), ProxyError> {
        if declared_length(parts).is_some_and(|len| len > self.max_body_size) {
            return Err(ProxyError::PayloadTooLarge);
        }

        let replayable = self.retries.enabled && is_idempotent(&parts.method) && self.selector.is_pool();
        let (buffered, mut streaming) = if replayable || route.require_model {
            let bytes = read_body(body, self.max_body_size).await?;
            if route.require_model {
                require_model(&bytes)?;
            }
            (Some(bytes), None)
        } else {
            (None, Some(limit_body(body, self.max_body_size)))
        };

        let mut excluded: Option<String> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let ctx = RequestContext {
                exclude: excluded.as_deref(),
            };
            let target = self.selector.select(&ctx, Instant::now())?;

            let body = match (&buffered, streaming.take()) {
                (Some(bytes), _) => Body::from(bytes.clone()),
                (None, Some(body)) => body,
                (None, None) => Body::empty(),
            };
            let upstream_request = self.build_request(parts, body, &target, route, caller, request_id)?;

            let result = with_timeout(TimeoutPhase::Response, self.idle, async {
                self.client.request(upstream_request).await.map_err(|e| upstream_error(&e))
            })
            .await;

            match result {
                Ok(response) => {
                    passive::observe_status(&self.selector, &target, response.status());
                    return Ok((target, response));
                }
                Err(e) => {
                    passive::observe_error(&self.selector, &target, &e);

                    if buffered.is_some() && should_retry(&self.retries, &parts.method, &e, attempt) {
                        let delay = retry_delay(attempt, &self.retries);
                        tracing::info!(
                            request_id = %request_id,
                            attempt,
                            upstream = %target.name,
                            delay = ?delay,
                            error = %e,
                            "Retrying on another upstream"
                        );
                        tokio::time::sleep(delay).await;
                        excluded = Some(target.name.clone());
                        continue;
                    }

                    tracing::warn!(
                        request_id = %request_id,
                        attempt,
                        upstream = %target.name,
                        error = %e,
                        "Upstream request failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn build_request(
        &self,
        parts: &Parts,
        body: Body,
        target: &UpstreamTarget,
        route: &RouteMatch,
        caller: &Caller,
        request_id: &str,
    ) -> Result<Request<Body>, ProxyError> {
        let mut headers = parts.headers.clone();
        headers::strip_hop_by_hop(&mut headers);
        headers::set_forwarded_headers(&mut headers, caller.client_addr, "http");
        headers.remove(header::HOST);
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        let mut request = Request::new(body);
        *request.method_mut() = parts.method.clone();
        *request.uri_mut() = target.http_uri(&route.path_and_query)?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    /// Wrap the upstream body with the idle timeout and session accounting.
    fn stream_body(&self, incoming: Incoming, target: Arc<UpstreamTarget>, session: SessionGuard, key_id: String) -> Body {
        let chunks = idle_timeout(
            Body::new(incoming).into_data_stream(),
            self.idle,
            session.cancel_token().clone(),
        );
        let selector = Arc::clone(&self.selector);
        let metrics = Arc::clone(&self.metrics);

        Body::from_stream(chunks.map(move |chunk| {
            match &chunk {
                Ok(bytes) => session.counters.add_down(bytes.len()),
                Err(e) => {
                    let error = match e.kind() {
                        io::ErrorKind::TimedOut => ProxyError::UpstreamTimeout {
                            phase: TimeoutPhase::Body,
                        },
                        io::ErrorKind::Interrupted => ProxyError::ShuttingDown,
                        _ => ProxyError::UpstreamError {
                            reason: e.to_string(),
                            connect: false,
                        },
                    };
                    if session.state.advance(SessionState::Failed) {
                        passive::observe_error(&selector, &target, &error);
                        metrics.record(MetricEvent::Error {
                            kind: error.kind(),
                            key_id: Some(key_id.clone()),
                        });
                        tracing::warn!(session_id = %session.id, upstream = %target.name, error = %error, "Response body aborted");
                    }
                }
            }
            chunk
        }))
    }
}

fn declared_length(parts: &Parts) -> Option<usize> {
    parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Read a whole request body, refusing more than `max` bytes.
async fn read_body(body: Body, max: usize) -> Result<Bytes, ProxyError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProxyError::BadRequest(format!("failed to read request body: {e}")))?;
        if buf.len() + chunk.len() > max {
            return Err(ProxyError::PayloadTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Pass a request body through, failing it once more than `max` bytes arrive.
fn limit_body(body: Body, max: usize) -> Body {
    let mut seen = 0usize;
    Body::from_stream(body.into_data_stream().map(move |chunk| {
        let chunk = chunk?;
        seen += chunk.len();
        if seen > max {
            return Err(axum::Error::new(ProxyError::PayloadTooLarge));
        }
        Ok(chunk)
    }))
}

/// Map a client error onto the proxy's taxonomy.
fn upstream_error(err: &hyper_util::client::legacy::Error) -> ProxyError {
    let mut cause = err.source();
    while let Some(current) = cause {
        if let Some(ProxyError::PayloadTooLarge) = current.downcast_ref::<ProxyError>() {
            return ProxyError::PayloadTooLarge;
        }
        if err.is_connect() {
            if let Some(io) = current.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return ProxyError::UpstreamTimeout {
                        phase: TimeoutPhase::Connect,
                    };
                }
            }
        }
        cause = current.source();
    }

    ProxyError::UpstreamError {
        reason: err.to_string(),
        connect: err.is_connect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_body_enforces_cap() {
        let ok = read_body(Body::from("0123456789"), 10).await.unwrap();
        assert_eq!(ok, Bytes::from_static(b"0123456789"));

        let err = read_body(Body::from("0123456789A"), 10).await.unwrap_err();
        assert!(matches!(err, ProxyError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn limited_body_fails_past_cap() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"aaaa")),
            Ok(Bytes::from_static(b"bbbb")),
        ]);
        let mut stream = limit_body(Body::from_stream(chunks), 6).into_data_stream();

        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn declared_length_parses_header() {
        let (parts, _) = Request::builder()
            .header(header::CONTENT_LENGTH, "42")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(declared_length(&parts), Some(42));

        let (parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert_eq!(declared_length(&parts), None);
    }
}
