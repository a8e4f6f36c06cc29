//! OpenWebUI Model-Server Proxy
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌────────────────────────────────────────────────────────┐
//!                  │                        PROXY                           │
//!                  │                                                        │
//!  Client ─────────┼─▶ request id ─▶ credential gate ─▶ rate limit          │
//!  (HTTP / WS)     │                                      │                 │
//!                  │                                      ▼                 │
//!                  │                  route table ─▶ session registry       │
//!                  │                                      │                 │
//!                  │                     ┌────────────────┴──────┐          │
//!                  │                     ▼                       ▼          │
//!                  │               HTTP forwarder         WebSocket relay ──┼──▶ Model
//!                  │                     │                       │          │    server(s)
//!                  │                     └──── upstream selector ┘          │
//!                  │                           (health, cooldown)           │
//!                  │                                                        │
//!                  │  /health  /metrics  /admin/*   config watcher  signals │
//!                  └────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use openwebui_proxy::config::watcher::ConfigWatcher;
use openwebui_proxy::config::{load_with_overrides, Overrides};
use openwebui_proxy::lifecycle::{shutdown_on_signal, Shutdown};
use openwebui_proxy::observability::{logging::init_logging, metrics::init_metrics};
use openwebui_proxy::HttpServer;

#[derive(Parser, Debug)]
#[command(name = "openwebui-proxy", version, about = "API-key gated proxy for OpenWebUI model servers")]
struct Args {
    /// TOML configuration file. Without one, defaults apply.
    #[arg(short, long, env = "OPENWEBUI_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`.
    #[arg(short, long, env = "OPENWEBUI_PROXY_BIND")]
    bind: Option<String>,

    /// Upstream base URL; repeat or comma-separate for a pool. Replaces the file's upstreams.
    #[arg(short, long = "upstream", env = "OPENWEBUI_PROXY_UPSTREAM", value_delimiter = ',')]
    upstreams: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let overrides = Overrides {
        bind_address: args.bind,
        upstreams: args.upstreams,
    };
    let config = load_with_overrides(args.config.as_deref(), &overrides)?;

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "openwebui-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstreams = ?config.upstreams.iter().map(|u| u.url.as_str()).collect::<Vec<_>>(),
        keys = config.auth.keys.len(),
        rate_limit = config.rate_limit.enabled,
        max_sessions = config.sessions.max_sessions,
        "Configuration loaded"
    );
    if config.auth.keys.is_empty() {
        tracing::warn!("No API keys configured; every proxied request will be rejected");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(config)?;

    // Keep the watcher alive for the life of the server.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, overrides.clone());
            server.watch_credentials(updates);
            match watcher.run() {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, keys will not hot-reload");
                    None
                }
            }
        }
        None => None,
    };

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
