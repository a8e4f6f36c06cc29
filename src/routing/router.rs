//! Route lookup and path rewriting.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up the matching route for a request
//! - Produce the upstream path and per-route body requirements
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) prefix scan (acceptable for typical route counts)
//! - Explicit NoMatch when routes exist; an empty table passes everything

use axum::http::request::Parts;

use crate::config::RouteConfig;
use crate::error::ProxyError;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};

#[derive(Debug)]
struct CompiledRoute {
    name: String,
    matcher: AndMatcher,
    prefix: PathPrefixMatcher,
    rewrite_prefix: Option<String>,
    require_model: bool,
}

/// Result of a route lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// `None` for passthrough.
    pub name: Option<String>,
    /// Path and query to request from the upstream.
    pub path_and_query: String,
    pub require_model: bool,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    pub fn new(configs: &[RouteConfig]) -> Self {
        let mut sorted: Vec<&RouteConfig> = configs.iter().collect();
        sorted.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.path_prefix.len().cmp(&a.path_prefix.len()))
        });

        let routes = sorted
            .into_iter()
            .map(|config| {
                let mut matchers: Vec<Box<dyn Matcher>> =
                    vec![Box::new(PathPrefixMatcher::new(config.path_prefix.clone()))];
                if let Some(host) = &config.host {
                    matchers.push(Box::new(HostMatcher::new(host.clone())));
                }
                CompiledRoute {
                    name: config.name.clone(),
                    matcher: AndMatcher::new(matchers),
                    prefix: PathPrefixMatcher::new(config.path_prefix.clone()),
                    rewrite_prefix: config.rewrite_prefix.clone(),
                    require_model: config.require_model,
                }
            })
            .collect();

        Self { routes }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn lookup(&self, head: &Parts) -> Result<RouteMatch, ProxyError> {
        let query = head.uri.query().map(|q| format!("?{q}")).unwrap_or_default();
        let path = head.uri.path();

        if self.routes.is_empty() {
            return Ok(RouteMatch {
                name: None,
                path_and_query: format!("{path}{query}"),
                require_model: false,
            });
        }

        let route = self
            .routes
            .iter()
            .find(|r| r.matcher.matches(head))
            .ok_or(ProxyError::RouteNotFound)?;

        let upstream_path = match &route.rewrite_prefix {
            Some(rewrite) => {
                let rest = &path[route.prefix.prefix().len()..];
                join_paths(rewrite, rest)
            }
            None => path.to_string(),
        };

        Ok(RouteMatch {
            name: Some(route.name.clone()),
            path_and_query: format!("{upstream_path}{query}"),
            require_model: route.require_model,
        })
    }
}

fn join_paths(prefix: &str, rest: &str) -> String {
    match (prefix.ends_with('/'), rest.starts_with('/')) {
        (true, true) => format!("{prefix}{}", &rest[1..]),
        (false, false) if !rest.is_empty() => format!("{prefix}/{rest}"),
        _ => format!("{prefix}{rest}"),
    }
}

/// Reject bodies without a non-empty string `model` field.
pub fn require_model(body: &[u8]) -> Result<(), ProxyError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| ProxyError::BadRequest("request body must be JSON".to_string()))?;

    match value.get("model").and_then(|m| m.as_str()) {
        Some(model) if !model.trim().is_empty() => Ok(()),
        _ => Err(ProxyError::BadRequest("model field is required".to_string())),
    }
}
