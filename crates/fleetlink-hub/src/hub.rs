//! The device hub facade.
//!
//! Both transports (HTTP poll and WebSocket streaming) are thin adapters
//! over this one entry point, which wires identity resolution, presence and
//! the mailbox together and owns the ordering between them: presence is only
//! ever touched after a credential resolves, so an unauthorized poll leaves
//! no trace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use fleetlink_core::Config;

use crate::error::{HubError, HubResult};
use crate::identity::IdentityResolver;
use crate::mailbox::CommandMailbox;
use crate::presence::PresenceTracker;
use crate::registry::DeviceRegistry;
use crate::types::{Command, CommandOutcome, CommandState, DeviceIdentity};

/// Control-plane presence view of one device.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub device_id: String,
    pub is_online: bool,
    /// Seconds since last contact; `None` if the device was never heard from.
    pub last_seen_secs: Option<u64>,
    pub last_ip: Option<String>,
    pub signal_metadata: HashMap<String, serde_json::Value>,
    pub pending_commands: usize,
}

/// Counts from one background sweep pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub devices_offline: usize,
    pub commands_expired: usize,
    pub terminals_dropped: usize,
    pub credentials_pruned: usize,
}

/// Bundles the identity resolver, presence tracker and command mailbox.
pub struct DeviceHub {
    registry: Arc<dyn DeviceRegistry>,
    identity: IdentityResolver,
    presence: PresenceTracker,
    mailbox: CommandMailbox,
}

impl DeviceHub {
    pub fn new(registry: Arc<dyn DeviceRegistry>, config: &Config) -> Self {
        let identity = IdentityResolver::new(
            Arc::clone(&registry),
            Duration::from_secs(config.identity.cache_ttl_secs),
        );
        Self {
            registry,
            identity,
            presence: PresenceTracker::new(&config.presence),
            mailbox: CommandMailbox::new(&config.mailbox),
        }
    }

    /// Resolve a credential without any side effects (streaming AUTH).
    pub async fn authenticate(&self, credential: &str) -> HubResult<DeviceIdentity> {
        self.identity.resolve(credential).await
    }

    /// Inbound status report: resolve, then record presence and metadata.
    pub async fn report_status(
        &self,
        credential: &str,
        ip: Option<&str>,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> HubResult<DeviceIdentity> {
        let identity = self.identity.resolve(credential).await?;
        self.presence.touch(&identity.device_id, ip, metadata).await;
        Ok(identity)
    }

    /// Device poll for its next command. Counts as presence contact.
    /// `Ok(None)` is the normal empty-mailbox result, not an error.
    pub async fn next_command(&self, credential: &str) -> HubResult<Option<Command>> {
        let identity = self.identity.resolve(credential).await?;
        self.presence
            .touch(&identity.device_id, None, &HashMap::new())
            .await;
        Ok(self.mailbox.dequeue_one(&identity.device_id).await)
    }

    /// Device confirmation of a delivered command. Counts as presence
    /// contact. Repeated confirms read back the recorded terminal state;
    /// unknown command ids are tolerated silently.
    pub async fn confirm(
        &self,
        credential: &str,
        command_id: &str,
        outcome: CommandOutcome,
    ) -> HubResult<Option<CommandState>> {
        let identity = self.identity.resolve(credential).await?;
        self.presence
            .touch(&identity.device_id, None, &HashMap::new())
            .await;
        Ok(self
            .mailbox
            .acknowledge(&identity.device_id, command_id, outcome)
            .await)
    }

    /// Control-plane command issuance, scoped to devices the user owns.
    ///
    /// Unknown and unowned devices are indistinguishable (`DeviceNotFound`)
    /// so the control plane cannot probe other users' device ids.
    pub async fn issue_command(
        &self,
        user_id: &str,
        device_id: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> HubResult<String> {
        let identity = self.owned_device(user_id, device_id).await?;
        if !identity.is_approved() {
            return Err(HubError::DeviceNotEligible(device_id.to_string()));
        }
        self.mailbox.enqueue(device_id, action, payload).await
    }

    /// Control-plane presence view, scoped like `issue_command`. The
    /// original dashboard only exposes approved devices; others read as
    /// not found.
    pub async fn device_status(&self, user_id: &str, device_id: &str) -> HubResult<DeviceStatus> {
        let identity = self.owned_device(user_id, device_id).await?;
        if !identity.is_approved() {
            return Err(HubError::DeviceNotFound(device_id.to_string()));
        }
        let snapshot = self.presence.snapshot(device_id).await;
        let pending_commands = self.mailbox.pending_count(device_id).await;
        Ok(match snapshot {
            Some(snap) => DeviceStatus {
                device_id: device_id.to_string(),
                is_online: snap.is_online,
                last_seen_secs: snap.last_seen.map(|at| at.elapsed().as_secs()),
                last_ip: snap.last_ip,
                signal_metadata: snap.signal_metadata,
                pending_commands,
            },
            None => DeviceStatus {
                device_id: device_id.to_string(),
                is_online: false,
                last_seen_secs: None,
                last_ip: None,
                signal_metadata: HashMap::new(),
                pending_commands,
            },
        })
    }

    /// The registry owns the ownership decision; the hub never reimplements
    /// it off `owner_id` so a backend with richer sharing semantics (teams,
    /// delegated access) stays authoritative.
    async fn owned_device(&self, user_id: &str, device_id: &str) -> HubResult<DeviceIdentity> {
        if !self
            .registry
            .device_belongs_to_user(device_id, user_id)
            .await?
        {
            debug!(device_id, user_id, "Ownership check failed");
            return Err(HubError::DeviceNotFound(device_id.to_string()));
        }
        self.registry
            .lookup_by_id(device_id)
            .await?
            .ok_or_else(|| HubError::DeviceNotFound(device_id.to_string()))
    }

    /// Record streaming-session contact for an authenticated device.
    pub async fn session_contact(
        &self,
        device_id: &str,
        ip: Option<&str>,
        metadata: &HashMap<String, serde_json::Value>,
    ) {
        self.presence.touch(device_id, ip, metadata).await;
    }

    /// Streaming-session teardown: presence offline, mailbox unsubscribed.
    ///
    /// A session superseded by a newer connection for the same device is a
    /// no-op here; the newer session owns presence and the subscription.
    pub async fn session_closed(&self, device_id: &str, subscription_id: u64) {
        if self.mailbox.unsubscribe(device_id, subscription_id).await {
            self.presence.mark_offline(device_id).await;
        }
    }

    /// Subscribe a streaming session to the device's mailbox.
    pub async fn subscribe_commands(&self, device_id: &str) -> (u64, mpsc::Receiver<Command>) {
        self.mailbox.subscribe(device_id).await
    }

    /// Acknowledge from a streaming session (already authenticated).
    pub async fn session_ack(
        &self,
        device_id: &str,
        command_id: &str,
        outcome: CommandOutcome,
    ) -> Option<CommandState> {
        self.presence.touch(device_id, None, &HashMap::new()).await;
        self.mailbox.acknowledge(device_id, command_id, outcome).await
    }

    /// Whether a device currently counts as online.
    pub async fn is_alive(&self, device_id: &str) -> bool {
        self.presence.is_alive(device_id).await
    }

    /// One pass of the periodic background chores: stale presence, overdue
    /// deliveries, terminal-record GC, credential-cache pruning.
    pub async fn sweep(&self) -> SweepReport {
        SweepReport {
            devices_offline: self.presence.sweep_stale().await.len(),
            commands_expired: self.mailbox.expire_overdue().await.len(),
            terminals_dropped: self.mailbox.gc_terminal().await,
            credentials_pruned: self.identity.prune_expired().await,
        }
    }
}
