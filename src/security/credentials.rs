//! API key validation.
//!
//! # Responsibilities
//! - Reject empty or malformed keys before any lookup
//! - Resolve a presented key to an `Identity` in O(1)
//! - Allow the credential set to be swapped at runtime
//!
//! # Design Decisions
//! - Keys are stored by SHA-256 digest; the raw key never leaves this module
//! - Every failure is the same `Unauthorized`; only the logs tell them apart
//! - No I/O on this path

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};

use crate::config::{AuthConfig, RateLimitConfig};
use crate::error::ProxyError;
use crate::observability::{MetricEvent, MetricsCollector};

/// Longest key accepted for lookup.
const MAX_KEY_LEN: usize = 512;

/// SHA-256 of a raw API key.
pub type KeyDigest = [u8; 32];

/// The authenticated principal behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Short digest prefix, safe to log.
    pub key_id: String,
    pub label: Option<String>,
    /// Rate-limit tier name.
    pub tier: String,
}

/// Source of truth for accepted keys.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, digest: &KeyDigest) -> Option<Identity>;
}

/// An immutable key set built from configuration.
#[derive(Debug, Default)]
pub struct CredentialSet {
    by_digest: HashMap<KeyDigest, Identity>,
}

impl CredentialSet {
    pub fn from_config(auth: &AuthConfig, rate_limit: &RateLimitConfig) -> Self {
        let by_digest = auth
            .keys
            .iter()
            .map(|k| {
                let digest = digest_key(&k.key);
                let identity = Identity {
                    key_id: key_id(&digest),
                    label: k.label.clone(),
                    tier: k.tier.clone().unwrap_or_else(|| rate_limit.default_tier.clone()),
                };
                (digest, identity)
            })
            .collect();
        Self { by_digest }
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

impl CredentialStore for CredentialSet {
    fn lookup(&self, digest: &KeyDigest) -> Option<Identity> {
        self.by_digest.get(digest).cloned()
    }
}

/// A `CredentialSet` that can be replaced while requests are in flight.
#[derive(Debug)]
pub struct ReloadableCredentials {
    current: ArcSwap<CredentialSet>,
}

impl ReloadableCredentials {
    pub fn new(set: CredentialSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(set),
        }
    }

    pub fn replace(&self, set: CredentialSet) {
        let count = set.len();
        self.current.store(Arc::new(set));
        tracing::info!(keys = count, "Credential set reloaded");
    }
}

impl CredentialStore for ReloadableCredentials {
    fn lookup(&self, digest: &KeyDigest) -> Option<Identity> {
        self.current.load().lookup(digest)
    }
}

pub fn digest_key(key: &str) -> KeyDigest {
    Sha256::digest(key.as_bytes()).into()
}

fn key_id(digest: &KeyDigest) -> String {
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

fn is_well_formed(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN && key.bytes().all(|b| b.is_ascii_graphic())
}

/// Validates presented keys.
pub struct CredentialGate {
    store: Arc<dyn CredentialStore>,
    metrics: Arc<MetricsCollector>,
}

impl CredentialGate {
    pub fn new(store: Arc<dyn CredentialStore>, metrics: Arc<MetricsCollector>) -> Self {
        Self { store, metrics }
    }

    /// Resolve `presented` to an identity.
    pub fn authenticate(&self, presented: &str) -> Result<Identity, ProxyError> {
        if !is_well_formed(presented) {
            tracing::debug!(len = presented.len(), "Rejected malformed or missing API key");
            return Err(self.reject());
        }

        match self.store.lookup(&digest_key(presented)) {
            Some(identity) => Ok(identity),
            None => {
                tracing::debug!("Rejected unknown API key");
                Err(self.reject())
            }
        }
    }

    fn reject(&self) -> ProxyError {
        self.metrics.record(MetricEvent::RejectedAuth);
        ProxyError::Unauthorized
    }
}
