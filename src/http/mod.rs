//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, middleware, dispatch)
//!     → request.rs (request ID, upgrade detection)
//!     → [security gate admits the caller]
//!     → [routing table rewrites the path]
//!     → forward.rs (unary HTTP, streamed back)
//!       or websocket.rs (upgrade, then frame relay)
//!     → endpoints.rs serves /health and /metrics beside the proxy
//! ```

pub mod endpoints;
pub mod forward;
pub mod request;
pub mod server;
pub mod websocket;

pub use request::X_REQUEST_ID;
pub use server::{AppState, HttpServer};
