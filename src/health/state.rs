//! Upstream health state machine.
//!
//! # States
//! - Unknown: not probed yet; eligible for traffic
//! - Healthy: receives traffic
//! - Unhealthy: excluded from selection
//!
//! # State Transitions
//! ```text
//! Unknown/Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unknown/Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Counters reset on the opposite outcome

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use serde::Serialize;

use crate::config::HealthCheckConfig;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub unhealthy: u32,
    pub healthy: u32,
}

impl From<&HealthCheckConfig> for Thresholds {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            unhealthy: config.unhealthy_threshold.max(1),
            healthy: config.healthy_threshold.max(1),
        }
    }
}

/// Probe-driven health of one upstream.
#[derive(Debug)]
pub struct HealthCell {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl HealthCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
        }
    }

    pub fn get(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Feed one probe result. Returns the new state if it changed.
    pub fn record(&self, success: bool, thresholds: Thresholds) -> Option<HealthState> {
        let (target, streak) = if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let n = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            (HealthState::Healthy, n >= thresholds.healthy)
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            (HealthState::Unhealthy, n >= thresholds.unhealthy)
        };

        if !streak {
            return None;
        }
        let previous = HealthState::from(self.state.swap(target as u8, Ordering::AcqRel));
        (previous != target).then_some(target)
    }
}

impl Default for HealthCell {
    fn default() -> Self {
        Self::new()
    }
}
