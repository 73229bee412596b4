//! Domain types shared across the hub.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Authorization state of a device in the external registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthState {
    Pending,
    Approved,
    Rejected,
    Suspended,
}

/// Read-only device identity resolved from a credential.
///
/// Owned by the external registry; the hub only reads it. Only `Approved`
/// devices may hold sessions or receive commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub owner_id: String,
    pub auth_state: AuthState,
}

impl DeviceIdentity {
    pub fn is_approved(&self) -> bool {
        self.auth_state == AuthState::Approved
    }
}

/// Lifecycle state of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    /// Enqueued, not yet handed to the device.
    Queued,
    /// Handed to the device, awaiting acknowledgment.
    Delivered,
    /// Device confirmed successful execution.
    Acknowledged,
    /// Device reported execution failure.
    Failed,
    /// Delivered but unacknowledged past the delivery timeout.
    Expired,
}

impl CommandState {
    /// Terminal states can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed | Self::Expired)
    }
}

/// Execution outcome reported by a device acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutcome {
    Success,
    Failure,
}

/// A unit of work addressed to one device.
#[derive(Debug, Clone)]
pub struct Command {
    pub command_id: String,
    pub device_id: String,
    /// Opaque action name, e.g. `led_on`. The hub never interprets it.
    pub action: String,
    /// Arbitrary structured payload, opaque to the hub.
    pub payload: serde_json::Value,
    pub state: CommandState,
    pub enqueued_at: Instant,
    /// Stamped when the command transitions to `Delivered`.
    pub delivered_at: Option<Instant>,
}

/// Per-device presence view.
#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    pub is_online: bool,
    /// When the device was last heard from; `None` if never.
    pub last_seen: Option<Instant>,
    pub last_ip: Option<String>,
    /// Last firmware-reported signal metadata (RSSI, LED state, ...).
    pub signal_metadata: HashMap<String, serde_json::Value>,
}
