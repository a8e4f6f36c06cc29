//! Shared utilities for integration testing: mock model servers and a proxy harness.
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use openwebui_proxy::config::{ApiKeyConfig, ProxyConfig, TierConfig, UpstreamConfig};
use openwebui_proxy::http::AppState;
use openwebui_proxy::{HttpServer, Shutdown};

pub const KEY: &str = "sk-alice";
pub const SUBPROTOCOL: &str = "openwebui.v1";
pub const MODELS_BODY: &str = r#"{"object":"list","data":[{"id":"llama3:8b","object":"model","owned_by":"library"}]}"#;

/// Serve `app` on an ephemeral port.
pub async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Counts calls and keeps the last request an upstream saw.
#[derive(Debug, Default)]
pub struct Recorder {
    calls: AtomicUsize,
    last: Mutex<Option<Recorded>>,
}

impl Recorder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Recorded {
        self.last.lock().unwrap().clone().expect("upstream saw no request")
    }
}

/// Answers every request with `MODELS_BODY`, plus a few special paths:
/// `/slow` waits before answering, `/stall` sends one chunk and goes quiet,
/// `/stream` sends several chunks.
pub async fn recording_upstream() -> (SocketAddr, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let seen = Arc::clone(&recorder);

    let app = Router::new().fallback(move |request: Request| {
        let seen = Arc::clone(&seen);
        async move {
            let (parts, body) = request.into_parts();
            let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
            seen.calls.fetch_add(1, Ordering::SeqCst);
            *seen.last.lock().unwrap() = Some(Recorded {
                method: parts.method.clone(),
                uri: parts.uri.to_string(),
                headers: parts.headers.clone(),
                body,
            });

            match parts.uri.path() {
                "/slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    MODELS_BODY.into_response()
                }
                "/stall" => {
                    let chunks = stream::iter([Ok::<_, Infallible>(Bytes::from_static(b"data: first\n\n"))])
                        .chain(stream::pending());
                    Response::new(Body::from_stream(chunks))
                }
                "/stream" => {
                    let chunks = stream::iter((0..5).map(|i| Ok::<_, Infallible>(Bytes::from(format!("data: {i}\n\n")))));
                    Response::new(Body::from_stream(chunks))
                }
                _ => {
                    let mut response = Response::new(Body::from(MODELS_BODY));
                    let headers = response.headers_mut();
                    headers.insert("content-type", HeaderValue::from_static("application/json"));
                    headers.insert("x-upstream", HeaderValue::from_static("mock"));
                    headers.insert("connection", HeaderValue::from_static("x-upstream-hop"));
                    headers.insert("x-upstream-hop", HeaderValue::from_static("1"));
                    response
                }
            }
        }
    });

    (spawn_upstream(app).await, recorder)
}

/// Echoes every WebSocket frame at `/ws`, selecting `SUBPROTOCOL`.
pub async fn ws_echo_upstream() -> SocketAddr {
    let app = Router::new().route(
        "/ws",
        get(|ws: WebSocketUpgrade| async move {
            ws.protocols([SUBPROTOCOL]).on_upgrade(|mut socket| async move {
                while let Some(Ok(message)) = socket.recv().await {
                    let is_close = matches!(message, Message::Close(_));
                    if socket.send(message).await.is_err() || is_close {
                        break;
                    }
                }
            })
        }),
    );
    spawn_upstream(app).await
}

/// A config pointing at `upstreams`, with one key and short timeouts.
pub fn config_for(upstreams: &[SocketAddr]) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstreams = upstreams
        .iter()
        .enumerate()
        .map(|(i, addr)| UpstreamConfig {
            name: format!("u{i}"),
            url: format!("http://{addr}"),
        })
        .collect();
    config.auth.keys = vec![ApiKeyConfig {
        key: KEY.into(),
        label: Some("alice".into()),
        tier: None,
    }];
    config.health_check.enabled = false;
    config.timeouts.connect_secs = 1;
    config.timeouts.idle_secs = 1;
    config.timeouts.close_grace_secs = 1;
    config.timeouts.drain_grace_secs = 1;
    config.retries.base_delay_ms = 10;
    config
}

pub fn with_limit(mut config: ProxyConfig, limit: u32, window_secs: u64) -> ProxyConfig {
    config
        .rate_limit
        .tiers
        .insert("default".into(), TierConfig { limit, window_secs });
    config
}

pub struct Proxy {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Shutdown,
    pub task: JoinHandle<std::io::Result<()>>,
}

impl Proxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Poll until no sessions are live, up to `limit`.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.state.sessions.active_count() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

pub async fn start_proxy(config: ProxyConfig) -> Proxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config).unwrap();
    let state = server.state().clone();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(server.run(listener, shutdown.clone()));
    Proxy {
        addr,
        state,
        shutdown,
        task,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
