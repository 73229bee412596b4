//! Device registry port.
//!
//! The registry of record (accounts, approvals, credential storage) lives in
//! the external web/admin layer. The hub consumes it through this trait and
//! never mutates authorization state itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::{Rng, distr::Alphanumeric};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{HubError, HubResult};
use crate::types::{AuthState, DeviceIdentity};

/// Length of issued API keys, matching the registry of record.
const CREDENTIAL_LEN: usize = 64;

/// Read-only view of the external device registry.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Look up a device by its API key. `Ok(None)` means unknown credential;
    /// an `Err` is an operational failure, not an auth decision.
    async fn lookup_by_credential(&self, credential: &str)
    -> HubResult<Option<DeviceIdentity>>;

    /// Look up a device by id, regardless of authorization state.
    async fn lookup_by_id(&self, device_id: &str) -> HubResult<Option<DeviceIdentity>>;

    /// Whether `device_id` exists and is owned by `user_id`.
    async fn device_belongs_to_user(&self, device_id: &str, user_id: &str) -> HubResult<bool>;
}

struct DeviceRecord {
    owner_id: String,
    auth_state: AuthState,
    credential: Option<String>,
}

/// In-memory registry for tests and single-node deployments.
///
/// Credential issuance is an explicit operation performed once at approval
/// time, never an implicit side effect of persisting a record.
#[derive(Clone, Default)]
pub struct StaticRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new device in the pending state. Returns `false` if the id
    /// is already taken.
    pub async fn register_device(&self, device_id: &str, owner_id: &str) -> bool {
        let mut devices = self.devices.write().await;
        if devices.contains_key(device_id) {
            return false;
        }
        devices.insert(
            device_id.to_string(),
            DeviceRecord {
                owner_id: owner_id.to_string(),
                auth_state: AuthState::Pending,
                credential: None,
            },
        );
        info!(device_id, owner_id, "Device registered (pending approval)");
        true
    }

    /// Approve a device and issue its API key. Idempotent on the key: a
    /// device approved twice keeps its original credential.
    pub async fn approve(&self, device_id: &str) -> HubResult<String> {
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| HubError::DeviceNotFound(device_id.to_string()))?;
        record.auth_state = AuthState::Approved;
        if let Some(existing) = &record.credential {
            return Ok(existing.clone());
        }
        let credential = generate_credential();
        record.credential = Some(credential.clone());
        info!(device_id, "Device approved, credential issued");
        Ok(credential)
    }

    /// Move a device to a non-approved state. The credential is kept so a
    /// later re-approval does not rotate keys, but lookups stop matching.
    pub async fn set_auth_state(&self, device_id: &str, state: AuthState) -> HubResult<()> {
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| HubError::DeviceNotFound(device_id.to_string()))?;
        record.auth_state = state;
        info!(device_id, ?state, "Device authorization state changed");
        Ok(())
    }

    /// Insert a device record with a pre-assigned credential, as when the
    /// registry is seeded from a file at startup. Replaces any existing
    /// record for the id.
    pub async fn seed(
        &self,
        device_id: &str,
        owner_id: &str,
        state: AuthState,
        credential: Option<String>,
    ) {
        self.devices.write().await.insert(
            device_id.to_string(),
            DeviceRecord {
                owner_id: owner_id.to_string(),
                auth_state: state,
                credential,
            },
        );
    }

    /// Revoke a device's API key outright.
    pub async fn revoke_credential(&self, device_id: &str) -> HubResult<()> {
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| HubError::DeviceNotFound(device_id.to_string()))?;
        record.credential = None;
        info!(device_id, "Device credential revoked");
        Ok(())
    }
}

fn generate_credential() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}

#[async_trait]
impl DeviceRegistry for StaticRegistry {
    async fn lookup_by_credential(
        &self,
        credential: &str,
    ) -> HubResult<Option<DeviceIdentity>> {
        let devices = self.devices.read().await;
        Ok(devices.iter().find_map(|(device_id, record)| {
            (record.credential.as_deref() == Some(credential)).then(|| DeviceIdentity {
                device_id: device_id.clone(),
                owner_id: record.owner_id.clone(),
                auth_state: record.auth_state,
            })
        }))
    }

    async fn lookup_by_id(&self, device_id: &str) -> HubResult<Option<DeviceIdentity>> {
        let devices = self.devices.read().await;
        Ok(devices.get(device_id).map(|record| DeviceIdentity {
            device_id: device_id.to_string(),
            owner_id: record.owner_id.clone(),
            auth_state: record.auth_state,
        }))
    }

    async fn device_belongs_to_user(&self, device_id: &str, user_id: &str) -> HubResult<bool> {
        let devices = self.devices.read().await;
        Ok(devices
            .get(device_id)
            .is_some_and(|record| record.owner_id == user_id))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approval_issues_credential_once() {
        let registry = StaticRegistry::new();
        assert!(registry.register_device("d1", "u1").await);

        let key = registry.approve("d1").await.unwrap();
        assert_eq!(key.len(), CREDENTIAL_LEN);

        // Re-approval keeps the original key
        let again = registry.approve("d1").await.unwrap();
        assert_eq!(key, again);
    }

    #[tokio::test]
    async fn lookup_matches_issued_credential() {
        let registry = StaticRegistry::new();
        registry.register_device("d1", "u1").await;
        let key = registry.approve("d1").await.unwrap();

        let identity = registry.lookup_by_credential(&key).await.unwrap().unwrap();
        assert_eq!(identity.device_id, "d1");
        assert_eq!(identity.owner_id, "u1");
        assert!(identity.is_approved());

        assert!(
            registry
                .lookup_by_credential("no-such-key")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn suspended_device_still_resolves_with_suspended_state() {
        let registry = StaticRegistry::new();
        registry.register_device("d1", "u1").await;
        let key = registry.approve("d1").await.unwrap();
        registry
            .set_auth_state("d1", AuthState::Suspended)
            .await
            .unwrap();

        let identity = registry.lookup_by_credential(&key).await.unwrap().unwrap();
        assert_eq!(identity.auth_state, AuthState::Suspended);
        assert!(!identity.is_approved());
    }

    #[tokio::test]
    async fn revoked_credential_stops_matching() {
        let registry = StaticRegistry::new();
        registry.register_device("d1", "u1").await;
        let key = registry.approve("d1").await.unwrap();
        registry.revoke_credential("d1").await.unwrap();

        assert!(
            registry
                .lookup_by_credential(&key)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn ownership_check() {
        let registry = StaticRegistry::new();
        registry.register_device("d1", "u1").await;

        assert!(registry.device_belongs_to_user("d1", "u1").await.unwrap());
        assert!(!registry.device_belongs_to_user("d1", "u2").await.unwrap());
        assert!(!registry.device_belongs_to_user("d2", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let registry = StaticRegistry::new();
        assert!(registry.register_device("d1", "u1").await);
        assert!(!registry.register_device("d1", "u2").await);
    }
}
