//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + CLI/env overrides
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → credential set swapped atomically
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only API keys reload live; everything else needs a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_with_overrides, parse_config, ConfigError, Overrides, DEFAULT_UPSTREAM};
pub use schema::{
    AdminConfig, ApiKeyConfig, AuthConfig, HealthCheckConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, ProxyConfig, RateLimitConfig, RetryConfig, RouteConfig, SecurityConfig,
    SelectionConfig, SessionConfig, TierConfig, TimeoutConfig, TlsConfig, UpstreamConfig, WebSocketConfig,
};
