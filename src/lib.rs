//! OpenWebUI Model-Server Proxy Library
//!
//! Sits between an OpenWebUI-style front end and one or more model servers,
//! forwarding HTTP and WebSocket traffic behind an API-key gate and per-key
//! rate limits.

pub mod admin;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod security;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
