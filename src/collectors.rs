//! Per-vendor collector configuration, cached from AWS Secrets Manager.
//!
//! Each vendor key maps to a secret named `{prefix}{vendor}` whose value is
//! `{"endpoint": "...", "headers": {...}, "protocol": "http/..."}`. Resolved
//! configs are cached in memory for the execution environment's lifetime
//! with a lazy TTL: entries are refreshed on lookup once stale, never swept
//! in the background.
//!
//! The cache is an explicit object owned by the application state, one
//! instance per execution environment. Entries are keyed strictly by vendor,
//! so one tenant's credentials are never served for another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use crate::config::{Config, OtlpProtocol};
use crate::error::ForwarderError;

/// Resolved export destination for one vendor. Immutable for the cache
/// entry's lifetime.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub endpoint: Url,
    pub headers: HashMap<String, String>,
    pub protocol: OtlpProtocol,
}

/// Expected shape of the secret value.
#[derive(Debug, Deserialize)]
struct SecretValue {
    endpoint: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    protocol: Option<String>,
}

struct CacheEntry {
    config: CollectorConfig,
    fetched_at: Instant,
}

/// Shared slot per vendor key. The slot mutex serialises concurrent
/// resolutions of the same key, so at most one secret fetch is in flight
/// per vendor; distinct vendors proceed independently.
type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

pub struct CollectorCache {
    client: SecretsManagerClient,
    prefix: String,
    ttl: std::time::Duration,
    fetch_timeout: std::time::Duration,
    default_protocol: OtlpProtocol,
    slots: Mutex<HashMap<String, Slot>>,
}

impl CollectorCache {
    pub fn new(client: SecretsManagerClient, config: &Config) -> Self {
        Self {
            client,
            prefix: config.secrets_key_prefix.clone(),
            ttl: config.cache_ttl,
            fetch_timeout: config.secret_fetch_timeout,
            default_protocol: config.default_protocol,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a vendor key to its collector config.
    ///
    /// Fresh cache entries are returned without I/O. On miss or expiry the
    /// secret is fetched; a failed refresh of an existing entry serves the
    /// stale value instead of failing, trading staleness for availability.
    #[instrument(skip(self), fields(cache.hit))]
    pub async fn resolve(&self, vendor: &str) -> Result<CollectorConfig, ForwarderError> {
        let slot = self.slot(vendor);
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() <= self.ttl {
                tracing::Span::current().record("cache.hit", true);
                return Ok(cached.config.clone());
            }
        }
        tracing::Span::current().record("cache.hit", false);

        match self.fetch(vendor).await {
            Ok(config) => {
                *entry = Some(CacheEntry {
                    config: config.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(config)
            }
            Err(ForwarderError::UnknownVendor(v)) => {
                // The secret is gone; stale credentials must not outlive it.
                *entry = None;
                Err(ForwarderError::UnknownVendor(v))
            }
            Err(e) => match entry.as_ref() {
                Some(stale) => {
                    tracing::warn!(
                        vendor = vendor,
                        error = %e,
                        "collector refresh failed, serving stale entry"
                    );
                    Ok(stale.config.clone())
                }
                None => Err(e),
            },
        }
    }

    fn slot(&self, vendor: &str) -> Slot {
        // The map lock is only held to clone the slot handle, never across
        // network I/O.
        let mut slots = self.slots.lock().unwrap();
        slots.entry(vendor.to_string()).or_default().clone()
    }

    async fn fetch(&self, vendor: &str) -> Result<CollectorConfig, ForwarderError> {
        let secret_id = format!("{}{}", self.prefix, vendor);

        let response = tokio::time::timeout(
            self.fetch_timeout,
            self.client.get_secret_value().secret_id(&secret_id).send(),
        )
        .await
        .map_err(|_| ForwarderError::SecretFetch {
            vendor: vendor.to_string(),
            reason: format!("timed out after {:?}", self.fetch_timeout),
        })?;

        let output = match response {
            Ok(output) => output,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_resource_not_found_exception() {
                    return Err(ForwarderError::UnknownVendor(vendor.to_string()));
                }
                return Err(ForwarderError::SecretFetch {
                    vendor: vendor.to_string(),
                    reason: service_err.to_string(),
                });
            }
        };

        let raw = output
            .secret_string()
            .ok_or_else(|| ForwarderError::SecretFetch {
                vendor: vendor.to_string(),
                reason: "secret has no string value".to_string(),
            })?;

        self.parse_secret(vendor, raw)
    }

    fn parse_secret(&self, vendor: &str, raw: &str) -> Result<CollectorConfig, ForwarderError> {
        let value: SecretValue =
            serde_json::from_str(raw).map_err(|e| ForwarderError::SecretFetch {
                vendor: vendor.to_string(),
                reason: format!("invalid secret JSON: {e}"),
            })?;

        let endpoint = Url::parse(&value.endpoint).map_err(|e| ForwarderError::SecretFetch {
            vendor: vendor.to_string(),
            reason: format!("invalid endpoint '{}': {e}", value.endpoint),
        })?;

        let protocol = match value.protocol.as_deref() {
            Some(p) => p.parse().map_err(|e| ForwarderError::SecretFetch {
                vendor: vendor.to_string(),
                reason: format!("{e}"),
            })?,
            None => self.default_protocol,
        };

        Ok(CollectorConfig {
            endpoint,
            headers: value.headers,
            protocol,
        })
    }
}
