//! Credential-to-identity resolution with a TTL cache.
//!
//! Every device poll carries an API key; resolving it against the registry of
//! record on each request would be a round-trip per poll, so lookups are
//! cached for a short TTL. Revocation therefore takes effect within one TTL
//! window, a documented bounded-staleness tradeoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};
use crate::registry::DeviceRegistry;
use crate::types::DeviceIdentity;

#[derive(Clone)]
struct CachedIdentity {
    identity: DeviceIdentity,
    cached_at: Instant,
}

/// Resolves API keys to device identities, caching registry lookups.
pub struct IdentityResolver {
    registry: Arc<dyn DeviceRegistry>,
    cache: RwLock<HashMap<String, CachedIdentity>>,
    ttl: Duration,
}

impl IdentityResolver {
    pub fn new(registry: Arc<dyn DeviceRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve a credential to an approved device identity.
    ///
    /// Unknown credentials and credentials of non-approved devices both fail
    /// with `Unauthorized`; the distinction is logged but never returned, so
    /// registry state does not leak to untrusted clients.
    pub async fn resolve(&self, credential: &str) -> HubResult<DeviceIdentity> {
        if credential.is_empty() {
            return Err(HubError::Unauthorized);
        }

        let identity = match self.cached(credential).await {
            Some(identity) => identity,
            None => {
                let looked_up = self.registry.lookup_by_credential(credential).await?;
                let Some(identity) = looked_up else {
                    warn!("Rejected unknown credential");
                    return Err(HubError::Unauthorized);
                };
                self.cache.write().await.insert(
                    credential.to_string(),
                    CachedIdentity {
                        identity: identity.clone(),
                        cached_at: Instant::now(),
                    },
                );
                identity
            }
        };

        if !identity.is_approved() {
            warn!(
                device_id = %identity.device_id,
                state = ?identity.auth_state,
                "Rejected credential of non-approved device"
            );
            return Err(HubError::Unauthorized);
        }

        Ok(identity)
    }

    async fn cached(&self, credential: &str) -> Option<DeviceIdentity> {
        let cache = self.cache.read().await;
        let entry = cache.get(credential)?;
        (entry.cached_at.elapsed() < self.ttl).then(|| entry.identity.clone())
    }

    /// Drop a cached credential so the next resolve hits the registry.
    pub async fn invalidate(&self, credential: &str) {
        if self.cache.write().await.remove(credential).is_some() {
            debug!("Invalidated cached credential");
        }
    }

    /// Drop all cache entries older than the TTL. Returns the count removed.
    pub async fn prune_expired(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
        before - cache.len()
    }
}
