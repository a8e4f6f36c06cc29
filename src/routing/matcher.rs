//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive, port ignored)
//! - Match path prefix on segment boundaries
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host matching is case-insensitive (RFC 9110)
//! - Path matching is case-sensitive
//! - No regex to guarantee O(n) matching

use axum::http::{header, request::Parts};

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    fn matches(&self, head: &Parts) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, head: &Parts) -> bool {
        head.headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| head.uri.host())
            .map(|h| h.split(':').next().unwrap_or(h).eq_ignore_ascii_case(&self.expected_host))
            .unwrap_or(false)
    }
}

/// Matches the request path prefix. `/chat` matches `/chat` and `/chat/x`,
/// never `/chatter`.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches_path(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/'),
            None => false,
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, head: &Parts) -> bool {
        self.matches_path(head.uri.path())
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, head: &Parts) -> bool {
        self.matchers.iter().all(|m| m.matches(head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn head(uri: &str, host: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("Host", host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");
        assert!(matcher.matches(&head("/", Some("example.com"))));
        assert!(matcher.matches(&head("/", Some("EXAMPLE.COM:8000"))));
        assert!(!matcher.matches(&head("/", Some("other.com"))));
        assert!(!matcher.matches(&head("/", None)));
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/chat");
        assert!(matcher.matches(&head("/chat", None)));
        assert!(matcher.matches(&head("/chat/stream?x=1", None)));
        assert!(!matcher.matches(&head("/chatter", None)));
        assert!(!matcher.matches(&head("/images", None)));

        assert!(PathPrefixMatcher::new("/").matches_path("/anything"));
    }

    #[test]
    fn and_matcher_requires_all() {
        let matcher = AndMatcher::new(vec![
            Box::new(HostMatcher::new("a.test")),
            Box::new(PathPrefixMatcher::new("/api")),
        ]);
        assert!(matcher.matches(&head("/api/x", Some("a.test"))));
        assert!(!matcher.matches(&head("/api/x", Some("b.test"))));
        assert!(!matcher.matches(&head("/web", Some("a.test"))));
    }
}
