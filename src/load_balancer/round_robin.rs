//! Round-robin selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{target::UpstreamTarget, LoadBalancer};

/// Rotates a counter and returns the first eligible target from its position.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_target(
        &self,
        targets: &[Arc<UpstreamTarget>],
        eligible: &dyn Fn(&UpstreamTarget) -> bool,
    ) -> Option<Arc<UpstreamTarget>> {
        if targets.is_empty() {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = targets.len();

        (0..len)
            .map(|i| &targets[(start + i) % len])
            .find(|t| eligible(t))
            .cloned()
    }
}
