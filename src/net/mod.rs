//! Session layer.
//!
//! # Data Flow
//! ```text
//! Admitted request or upgrade
//!     → registry.rs (ceiling check, register, child cancel token)
//!     → session.rs (state machine, byte/frame counters)
//!     → Hand off to forwarder or WebSocket relay
//!     → SessionGuard dropped → deregistered
//!
//! Session States:
//!     Connecting → Relaying → Closing → Closed
//!                         ↘ Failed
//! ```
//!
//! # Design Decisions
//! - Every in-flight exchange is a session, HTTP or WebSocket
//! - Shutdown drains through the registry, not through the listener
//! - TLS is optional and handled by axum-server

pub mod registry;
pub mod session;
pub mod tls;

pub use registry::{SessionGuard, SessionRegistry};
pub use session::{Protocol, ProxySession, SessionId, SessionInfo, SessionState};
