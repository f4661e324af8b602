//! Resolver configuration.
//!
//! The JSON form uses camelCase keys so the service worker can pass the
//! same object it reads from its own settings. Every field has a default;
//! a partial object only overrides what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("gateway endpoint {url:?} is not an http(s) URL")]
    InvalidGateway { url: String },

    #[error("invalid configuration JSON: {0}")]
    Json(String),
}

/// Tunables for one resolver instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverConfig {
    /// Byte budget of the content cache.
    pub cache_byte_budget: usize,

    /// Maximum peer sessions in flight, per fetch and across all fetches.
    pub peer_concurrency_cap: usize,

    /// How long peers get before the gateway is tried, measured from the
    /// start of discovery.
    pub fallback_timeout_ms: u64,

    /// Primary gateway. Requests go to `{gatewayEndpoint}/{cid}`.
    pub gateway_endpoint: String,

    /// Further gateways, tried in order after the primary.
    pub fallback_gateways: Vec<String>,

    /// Most providers taken from one directory lookup.
    pub max_providers: usize,

    /// Upper bound on a directory lookup.
    pub provider_timeout_ms: u64,

    /// Upper bound on session negotiation with one peer.
    pub negotiation_timeout_ms: u64,

    /// Longest silence tolerated on an open transfer.
    pub idle_timeout_ms: u64,

    /// Upper bound on one gateway request.
    pub gateway_timeout_ms: u64,

    /// How long losing sessions get to close after a winner is chosen.
    pub cancel_grace_ms: u64,

    /// Deadline applied to a fetch that does not specify its own.
    pub resolve_deadline_ms: u64,

    /// Largest object accepted from any source.
    pub max_content_size: usize,

    /// How long a peer's known addresses are reused between lookups.
    pub address_cache_ttl_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_byte_budget: 64 * 1024 * 1024,
            peer_concurrency_cap: 4,
            fallback_timeout_ms: 2_000,
            gateway_endpoint: "https://ipfs.io/ipfs".to_string(),
            fallback_gateways: Vec::new(),
            max_providers: 20,
            provider_timeout_ms: 10_000,
            negotiation_timeout_ms: 5_000,
            idle_timeout_ms: 5_000,
            gateway_timeout_ms: 15_000,
            cancel_grace_ms: 500,
            resolve_deadline_ms: 30_000,
            max_content_size: 100 * 1024 * 1024,
            address_cache_ttl_ms: 60_000,
        }
    }
}

impl ResolverConfig {
    /// Parse a (possibly partial) JSON configuration and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("cacheByteBudget", self.cache_byte_budget as u64),
            ("peerConcurrencyCap", self.peer_concurrency_cap as u64),
            ("maxProviders", self.max_providers as u64),
            ("providerTimeoutMs", self.provider_timeout_ms),
            ("negotiationTimeoutMs", self.negotiation_timeout_ms),
            ("idleTimeoutMs", self.idle_timeout_ms),
            ("gatewayTimeoutMs", self.gateway_timeout_ms),
            ("resolveDeadlineMs", self.resolve_deadline_ms),
            ("maxContentSize", self.max_content_size as u64),
        ];
        if let Some(&(field, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        for url in self.gateway_endpoints() {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ConfigError::InvalidGateway {
                    url: url.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Primary gateway followed by the fallbacks, in the order they are tried.
    pub fn gateway_endpoints(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.gateway_endpoint.as_str())
            .chain(self.fallback_gateways.iter().map(String::as_str))
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn resolve_deadline(&self) -> Duration {
        Duration::from_millis(self.resolve_deadline_ms)
    }

    pub fn address_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.address_cache_ttl_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_content_size: self.max_content_size,
        }
    }
}
