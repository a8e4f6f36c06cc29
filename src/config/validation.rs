//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (keys reference existing tiers)
//! - Validate value ranges (timeouts > 0, limits > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;
use url::Url;

use crate::config::schema::ProxyConfig;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "not a socket address"));
    }

    validate_upstreams(config, &mut errors);
    validate_auth(config, &mut errors);
    validate_rate_limit(config, &mut errors);

    for (i, route) in config.routes.iter().enumerate() {
        if !route.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("routes[{i}].path_prefix"),
                "must start with '/'",
            ));
        }
        if let Some(rewrite) = &route.rewrite_prefix {
            if !rewrite.starts_with('/') {
                errors.push(ValidationError::new(
                    format!("routes[{i}].rewrite_prefix"),
                    "must start with '/'",
                ));
            }
        }
    }

    let t = &config.timeouts;
    for (field, value) in [
        ("timeouts.connect_secs", t.connect_secs),
        ("timeouts.idle_secs", t.idle_secs),
        ("timeouts.write_secs", t.write_secs),
        ("timeouts.close_grace_secs", t.close_grace_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.websocket.max_buffered_frames == 0 {
        errors.push(ValidationError::new("websocket.max_buffered_frames", "must be greater than 0"));
    }
    if config.websocket.max_buffered_bytes == 0 {
        errors.push(ValidationError::new("websocket.max_buffered_bytes", "must be greater than 0"));
    }
    if config.sessions.max_sessions == 0 {
        errors.push(ValidationError::new("sessions.max_sessions", "must be greater than 0"));
    }

    if config.health_check.enabled && config.health_check.interval_secs == 0 {
        errors.push(ValidationError::new("health_check.interval_secs", "must be greater than 0"));
    }

    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "required when admin is enabled"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_upstreams(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    if config.upstreams.is_empty() {
        errors.push(ValidationError::new("upstreams", "at least one upstream is required"));
    }

    let mut names = HashSet::new();
    for (i, upstream) in config.upstreams.iter().enumerate() {
        if !names.insert(upstream.name.as_str()) {
            errors.push(ValidationError::new(
                format!("upstreams[{i}].name"),
                format!("duplicate upstream name '{}'", upstream.name),
            ));
        }
        match Url::parse(&upstream.url) {
            Ok(url) if url.scheme() != "http" => errors.push(ValidationError::new(
                format!("upstreams[{i}].url"),
                "only http:// upstreams are supported",
            )),
            Ok(url) if url.host_str().is_none() => errors.push(ValidationError::new(
                format!("upstreams[{i}].url"),
                "missing host",
            )),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::new(format!("upstreams[{i}].url"), e.to_string())),
        }
    }
}

fn validate_auth(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    if config.auth.header.trim().is_empty() {
        errors.push(ValidationError::new("auth.header", "must not be empty"));
    }
    let mut seen = HashSet::new();
    for (i, key) in config.auth.keys.iter().enumerate() {
        if key.key.is_empty() {
            errors.push(ValidationError::new(format!("auth.keys[{i}].key"), "must not be empty"));
        }
        if !seen.insert(key.key.as_str()) {
            errors.push(ValidationError::new(format!("auth.keys[{i}].key"), "duplicate key"));
        }
        if let Some(tier) = &key.tier {
            if !config.rate_limit.tiers.contains_key(tier) {
                errors.push(ValidationError::new(
                    format!("auth.keys[{i}].tier"),
                    format!("unknown tier '{tier}'"),
                ));
            }
        }
    }
}

fn validate_rate_limit(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    let rl = &config.rate_limit;
    if !rl.tiers.contains_key(&rl.default_tier) {
        errors.push(ValidationError::new(
            "rate_limit.default_tier",
            format!("unknown tier '{}'", rl.default_tier),
        ));
    }
    for (name, tier) in &rl.tiers {
        if tier.limit == 0 {
            errors.push(ValidationError::new(format!("rate_limit.tiers.{name}.limit"), "must be greater than 0"));
        }
        if tier.window_secs == 0 {
            errors.push(ValidationError::new(
                format!("rate_limit.tiers.{name}.window_secs"),
                "must be greater than 0",
            ));
        }
    }
    if rl.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("rate_limit.sweep_interval_secs", "must be greater than 0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ApiKeyConfig, UpstreamConfig};

    fn valid() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.upstreams.push(UpstreamConfig {
            name: "ollama".into(),
            url: "http://localhost:11434".into(),
        });
        config.auth.keys.push(ApiKeyConfig {
            key: "sk-test".into(),
            label: None,
            tier: None,
        });
        config
    }

    #[test]
    fn accepts_minimal_config() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = valid();
        config.upstreams.clear();
        config.auth.keys[0].tier = Some("gold".into());
        config.timeouts.connect_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"upstreams"));
        assert!(fields.contains(&"auth.keys[0].tier"));
        assert!(fields.contains(&"timeouts.connect_secs"));
    }

    #[test]
    fn rejects_tls_upstreams() {
        let mut config = valid();
        config.upstreams[0].url = "https://models.internal".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "upstreams[0].url");
    }

    #[test]
    fn empty_key_set_is_allowed() {
        let mut config = valid();
        config.auth.keys.clear();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn enabled_admin_needs_a_key() {
        let mut config = valid();
        config.admin.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "admin.api_key");

        config.admin.api_key = "ops-token".into();
        assert!(validate_config(&config).is_ok());
    }
}
