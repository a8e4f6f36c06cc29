//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each upstream
//!     → Update state.rs
//!
//! Passive health checks (passive.rs):
//!     Forwarding failure observed
//!     → Target put on cooldown
//!
//! State machine (state.rs):
//!     Unknown → Healthy ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - State transitions require consecutive successes/failures
//! - Health state is per-target, not per-pool

pub mod active;
pub mod passive;
pub mod state;

pub use active::HealthMonitor;
pub use state::HealthState;
