//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{ProxyConfig, UpstreamConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("Invalid upstream {name}: {source}")]
    Upstream {
        name: String,
        #[source]
        source: url::ParseError,
    },
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Upstream used when neither the file nor the command line names one.
pub const DEFAULT_UPSTREAM: &str = "http://localhost:11434";

/// Command-line and environment values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind_address: Option<String>,
    /// Replaces the file's upstream list when non-empty.
    pub upstreams: Vec<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(bind) = &self.bind_address {
            config.listener.bind_address = bind.clone();
        }
        if !self.upstreams.is_empty() {
            config.upstreams = self
                .upstreams
                .iter()
                .enumerate()
                .map(|(i, url)| UpstreamConfig {
                    name: format!("upstream-{i}"),
                    url: url.clone(),
                })
                .collect();
        }
        if config.upstreams.is_empty() {
            config.upstreams.push(UpstreamConfig {
                name: "default".to_string(),
                url: DEFAULT_UPSTREAM.to_string(),
            });
        }
    }
}

/// Read the optional file, apply overrides, then validate the result.
pub fn load_with_overrides(path: Option<&Path>, overrides: &Overrides) -> Result<ProxyConfig, ConfigError> {
    let mut config: ProxyConfig = match path {
        Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
        None => ProxyConfig::default(),
    };
    overrides.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fill_in_default_upstream() {
        let config = load_with_overrides(None, &Overrides::default()).unwrap();
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].url, DEFAULT_UPSTREAM);
    }

    #[test]
    fn overrides_replace_upstreams_and_bind() {
        let mut config = parse_config(
            r#"
            [[upstreams]]
            name = "file"
            url = "http://10.0.0.1:11434"
            "#,
        )
        .unwrap();
        Overrides {
            bind_address: Some("127.0.0.1:9000".into()),
            upstreams: vec!["http://a:1".into(), "http://b:2".into()],
        }
        .apply(&mut config);

        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
        let names: Vec<_> = config.upstreams.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["upstream-0", "upstream-1"]);
    }

    #[test]
    fn parses_full_document() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:8000"

            [[upstreams]]
            name = "ollama"
            url = "http://localhost:11434"

            [[auth.keys]]
            key = "sk-alice"
            label = "alice"
            tier = "pro"

            [rate_limit.tiers.default]
            limit = 10
            window_secs = 60

            [rate_limit.tiers.pro]
            limit = 100
            window_secs = 60

            [[routes]]
            name = "chat"
            path_prefix = "/chat"
            rewrite_prefix = "/api/chat"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstreams[0].name, "ollama");
        assert_eq!(config.auth.keys[0].tier.as_deref(), Some("pro"));
        assert_eq!(config.rate_limit.tiers["pro"].limit, 100);
        assert_eq!(config.routes[0].rewrite_prefix.as_deref(), Some("/api/chat"));
        assert_eq!(config.timeouts.connect_secs, 5);
    }

    #[test]
    fn surfaces_validation_errors() {
        let err = parse_config("[listener]\nbind_address = \"127.0.0.1:8000\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("upstreams"));
    }
}
