//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → access_control.rs (extract key, authenticate, attach Identity)
//!     → rate_limit.rs (per-identity fixed window)
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-*)
//!     → Pass to routing
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any security check failure
//! - Every authentication failure looks the same from outside
//! - No trust in client input

pub mod access_control;
pub mod credentials;
pub mod headers;
pub mod rate_limit;

pub use credentials::{CredentialGate, CredentialSet, CredentialStore, Identity, ReloadableCredentials};
pub use rate_limit::RateLimiter;
