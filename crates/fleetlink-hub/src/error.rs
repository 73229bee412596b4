//! Hub error taxonomy.
//!
//! The gateway maps these onto wire responses; `Unauthorized` and
//! `DeviceNotEligible` must look identical to untrusted clients, the
//! distinction exists for logs and the control plane only.

use thiserror::Error;

/// Result type alias using `HubError`.
pub type HubResult<T> = std::result::Result<T, HubError>;

/// Errors surfaced by hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// Unknown, revoked, or missing credential.
    #[error("Invalid API key")]
    Unauthorized,

    /// Known device that is not in the approved state.
    #[error("Device not eligible: {0}")]
    DeviceNotEligible(String),

    /// Control-plane operation addressed an unknown (or unowned) device.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Per-device pending command cap reached; the new enqueue was rejected.
    #[error("Too many pending commands for device {0}")]
    QueueFull(String),

    /// Registry lookup failed for an operational reason (not an auth decision).
    #[error("Registry error: {0}")]
    Registry(String),
}
