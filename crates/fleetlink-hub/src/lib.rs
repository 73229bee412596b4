//! `Fleetlink` Device Hub
//!
//! The domain core behind the session gateway:
//! - Credential-to-identity resolution with a TTL cache
//! - Per-device presence tracking with a liveness window
//! - Per-device FIFO command mailboxes with single-in-flight delivery
//! - The `DeviceHub` facade both transports (poll and streaming) call into
//!
//! All mutable state is partitioned by device id; operations on one device
//! never contend with another device's.

pub mod error;
pub mod hub;
pub mod identity;
pub mod mailbox;
pub mod presence;
pub mod registry;
pub mod types;

pub use error::{HubError, HubResult};
pub use hub::{DeviceHub, DeviceStatus, SweepReport};
pub use identity::IdentityResolver;
pub use mailbox::CommandMailbox;
pub use presence::PresenceTracker;
pub use registry::{DeviceRegistry, StaticRegistry};
pub use types::{
    AuthState, Command, CommandOutcome, CommandState, DeviceIdentity, PresenceSnapshot,
};
