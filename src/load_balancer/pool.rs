//! Upstream pool and selection.
//!
//! # Responsibilities
//! - Own the configured upstream targets
//! - Pick a target per request or session
//! - Apply reactive failure marking

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, SelectionConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::load_balancer::{round_robin::RoundRobin, target::UpstreamTarget, LoadBalancer};

/// Per-request selection inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext<'a> {
    /// Target to avoid, e.g. the one a failed first attempt used.
    pub exclude: Option<&'a str>,
}

/// Resolves the upstream for each request.
pub struct UpstreamSelector {
    targets: Vec<Arc<UpstreamTarget>>,
    balancer: Box<dyn LoadBalancer>,
    force_through: bool,
    cooldown: Duration,
}

impl UpstreamSelector {
    pub fn new(upstreams: &[UpstreamConfig], selection: &SelectionConfig) -> Result<Self, ConfigError> {
        let targets = upstreams
            .iter()
            .map(|u| {
                UpstreamTarget::new(u.name.clone(), &u.url)
                    .map(Arc::new)
                    .map_err(|source| ConfigError::Upstream {
                        name: u.name.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            targets,
            balancer: Box::new(RoundRobin::new()),
            force_through: selection.force_through,
            cooldown: Duration::from_secs(selection.cooldown_secs),
        })
    }

    /// Pick a target.
    ///
    /// A single configured upstream is returned regardless of health. A pool
    /// round-robins over eligible targets and, with `force_through`, over all
    /// of them when none is eligible.
    pub fn select(&self, ctx: &RequestContext<'_>, now: Instant) -> Result<Arc<UpstreamTarget>, ProxyError> {
        let allowed = |t: &UpstreamTarget| ctx.exclude != Some(t.name.as_str());

        if let [only] = self.targets.as_slice() {
            return if allowed(only.as_ref()) {
                Ok(Arc::clone(only))
            } else {
                Err(ProxyError::NoUpstreamAvailable)
            };
        }

        if let Some(target) = self
            .balancer
            .next_target(&self.targets, &|t| allowed(t) && t.is_eligible(now))
        {
            return Ok(target);
        }

        if self.force_through {
            if let Some(target) = self.balancer.next_target(&self.targets, &allowed) {
                tracing::debug!(upstream = %target.name, "No healthy upstream, forcing through");
                return Ok(target);
            }
        }

        tracing::debug!(pool_size = self.targets.len(), "No eligible upstream");
        Err(ProxyError::NoUpstreamAvailable)
    }

    /// Record a forwarding failure against `target`.
    pub fn report_failure(&self, target: &UpstreamTarget, now: Instant) {
        target.mark_failed(self.cooldown, now);
    }

    pub fn targets(&self) -> &[Arc<UpstreamTarget>] {
        &self.targets
    }

    /// Whether more than one target could serve a request.
    pub fn is_pool(&self) -> bool {
        self.targets.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::Thresholds;

    fn selector(names: &[&str], force_through: bool) -> UpstreamSelector {
        let upstreams: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, name)| UpstreamConfig {
                name: name.to_string(),
                url: format!("http://127.0.0.1:{}", 9100 + i),
            })
            .collect();
        let selection = SelectionConfig {
            force_through,
            cooldown_secs: 10,
        };
        UpstreamSelector::new(&upstreams, &selection).unwrap()
    }

    fn mark_unhealthy(target: &UpstreamTarget) {
        target.record_probe(false, Thresholds { unhealthy: 1, healthy: 1 });
    }

    #[test]
    fn single_upstream_ignores_health() {
        let sel = selector(&["only"], false);
        mark_unhealthy(&sel.targets()[0]);
        let now = Instant::now();
        assert_eq!(sel.select(&RequestContext::default(), now).unwrap().name, "only");

        let ctx = RequestContext { exclude: Some("only") };
        assert!(matches!(sel.select(&ctx, now), Err(ProxyError::NoUpstreamAvailable)));
    }

    #[test]
    fn pool_skips_unhealthy_and_cooling_targets() {
        let sel = selector(&["a", "b", "c"], false);
        let now = Instant::now();
        mark_unhealthy(&sel.targets()[0]);
        sel.report_failure(&sel.targets()[1], now);

        for _ in 0..3 {
            assert_eq!(sel.select(&RequestContext::default(), now).unwrap().name, "c");
        }
    }

    #[test]
    fn all_unhealthy_fails_without_force_through() {
        let sel = selector(&["a", "b"], false);
        sel.targets().iter().for_each(|t| mark_unhealthy(t));
        assert!(matches!(
            sel.select(&RequestContext::default(), Instant::now()),
            Err(ProxyError::NoUpstreamAvailable)
        ));
    }

    #[test]
    fn force_through_uses_unhealthy_targets() {
        let sel = selector(&["a", "b"], true);
        sel.targets().iter().for_each(|t| mark_unhealthy(t));
        let ctx = RequestContext { exclude: Some("a") };
        assert_eq!(sel.select(&ctx, Instant::now()).unwrap().name, "b");
    }

    #[test]
    fn exclusion_picks_alternate() {
        let sel = selector(&["a", "b"], false);
        let ctx = RequestContext { exclude: Some("a") };
        for _ in 0..4 {
            assert_eq!(sel.select(&ctx, Instant::now()).unwrap().name, "b");
        }
    }
}
