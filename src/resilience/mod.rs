//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to upstream:
//!     → timeouts.rs (connect / response / idle-body deadlines)
//!     → On failure: retries.rs (retryable? one more attempt elsewhere)
//!     → backoff.rs (jittered delay before that attempt)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Retries only for idempotent requests (GET, HEAD, etc.)
//! - Failing upstreams are cooled down by the health layer, not here

pub mod backoff;
pub mod retries;
pub mod timeouts;
