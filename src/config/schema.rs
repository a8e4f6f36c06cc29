//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Model servers requests are forwarded to.
    pub upstreams: Vec<UpstreamConfig>,

    /// Selection policy across the upstream pool.
    pub selection: SelectionConfig,

    /// Optional route table. Empty means every path passes through.
    pub routes: Vec<RouteConfig>,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// API key settings.
    pub auth: AuthConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// WebSocket relay limits.
    pub websocket: WebSocketConfig,

    /// Session registry limits.
    pub sessions: SessionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    pub security: SecurityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8000").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// A single model server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Identifier used in logs, metrics and `/health`.
    pub name: String,

    /// Base URL, e.g. "http://localhost:11434". May carry a path prefix.
    pub url: String,
}

/// Upstream selection policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Route to unhealthy targets when nothing healthy is left.
    pub force_through: bool,

    /// How long a target stays out of rotation after a forwarding failure.
    pub cooldown_secs: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            force_through: false,
            cooldown_secs: 10,
        }
    }
}

/// Route configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    #[serde(default)]
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: String,

    /// Replacement for the matched prefix on the upstream side.
    #[serde(default)]
    pub rewrite_prefix: Option<String>,

    /// Reject requests whose JSON body has no non-empty `model` field.
    #[serde(default)]
    pub require_model: bool,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Path to probe on each upstream.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 5,
            path: "/".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Timeout configuration for upstream and session operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connect (and WebSocket handshake) timeout in seconds.
    pub connect_secs: u64,

    /// Maximum silence while waiting for response headers or body chunks.
    pub idle_secs: u64,

    /// Maximum time for a single write to either side of a relay.
    pub write_secs: u64,

    /// How long a closing WebSocket waits for the peer's close frame.
    pub close_grace_secs: u64,

    /// How long shutdown waits for sessions before cancelling them.
    pub drain_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            idle_secs: 120,
            write_secs: 10,
            close_grace_secs: 5,
            drain_grace_secs: 30,
        }
    }
}

/// API key configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Header carrying the key. `authorization` expects a `Bearer` prefix;
    /// any other header is read verbatim.
    pub header: String,

    /// Query parameter fallback (e.g. for browser WebSocket clients).
    pub query_param: Option<String>,

    /// Accepted keys.
    pub keys: Vec<ApiKeyConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: "authorization".to_string(),
            query_param: Some("api_key".to_string()),
            keys: Vec::new(),
        }
    }
}

/// One accepted API key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyConfig {
    pub key: String,

    #[serde(default)]
    pub label: Option<String>,

    /// Rate-limit tier name; falls back to `rate_limit.default_tier`.
    #[serde(default)]
    pub tier: Option<String>,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Tier applied to keys without an explicit tier.
    pub default_tier: String,

    /// Tier definitions by name.
    pub tiers: HashMap<String, TierConfig>,

    /// How often idle budgets are evicted.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "default".to_string(),
            TierConfig {
                limit: 60,
                window_secs: 60,
            },
        );
        Self {
            enabled: true,
            default_tier: "default".to_string(),
            tiers,
            sweep_interval_secs: 60,
        }
    }
}

/// Fixed-window budget for one tier.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TierConfig {
    /// Requests admitted per window.
    pub limit: u32,

    /// Window length in seconds.
    pub window_secs: u64,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry idempotent requests once on connection-level failures.
    pub enabled: bool,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 50,
            max_delay_ms: 1000,
        }
    }
}

/// WebSocket relay limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Frames buffered per direction before the consumer is declared slow.
    pub max_buffered_frames: usize,

    /// Bytes buffered per direction before the consumer is declared slow.
    pub max_buffered_bytes: usize,

    /// Largest single message accepted from the client.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_buffered_frames: 256,
            max_buffered_bytes: 4 * 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Session registry limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Concurrent HTTP requests plus WebSocket sessions.
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Prometheus exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Operator surface under `/admin/*`. Its key is separate from client keys.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    /// Bearer token expected on every admin request. Required when enabled.
    pub api_key: String,
}

/// Request hardening.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 16 * 1024 * 1024,
        }
    }
}
