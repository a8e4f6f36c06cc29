//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → router.rs (route lookup, prefix rewrite)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: RouteMatch or RouteNotFound
//!
//! Route Compilation (at startup):
//!     RouteConfig[]
//!     → Sort by priority, then prefix length
//!     → Compile matchers
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - Deterministic: same input always matches same route
//! - No routes configured means every path passes through unchanged

pub mod matcher;
pub mod router;

pub use router::{require_model, RouteMatch, RouteTable};
