//! Upstream selection subsystem.
//!
//! # Data Flow
//! ```text
//! Admitted request
//!     → pool.rs (single target, or pool with exclusions)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through eligible targets)
//!     → target.rs (health + cooldown, URI construction)
//!     → Return target or NoUpstreamAvailable
//! ```
//!
//! # Design Decisions
//! - Load balancer is stateless apart from its counter; targets track health
//! - Unhealthy and cooling-down targets excluded from selection
//! - Health is updated out of band by the prober and by forwarding failures

pub mod pool;
pub mod round_robin;
pub mod target;

use std::sync::Arc;

pub use pool::{RequestContext, UpstreamSelector};
pub use target::{TargetSnapshot, UpstreamTarget};

/// Picks one target out of a slice.
pub trait LoadBalancer: Send + Sync {
    fn next_target(
        &self,
        targets: &[Arc<UpstreamTarget>],
        eligible: &dyn Fn(&UpstreamTarget) -> bool,
    ) -> Option<Arc<UpstreamTarget>>;
}
