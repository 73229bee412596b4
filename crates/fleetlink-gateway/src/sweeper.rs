//! Periodic background chores.
//!
//! One task per gateway process walks the hub on a fixed interval: stale
//! presence records go offline, overdue deliveries expire, old terminal
//! command records and stale credential-cache entries are dropped. All three
//! timeouts are also evaluated lazily on the request path; the sweeper just
//! bounds how long stale state can linger unobserved.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use fleetlink_hub::DeviceHub;

/// Spawn the background sweep task.
pub fn spawn_sweeper(hub: Arc<DeviceHub>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick
        loop {
            timer.tick().await;
            let report = hub.sweep().await;
            if report.devices_offline > 0
                || report.commands_expired > 0
                || report.terminals_dropped > 0
                || report.credentials_pruned > 0
            {
                info!(
                    devices_offline = report.devices_offline,
                    commands_expired = report.commands_expired,
                    terminals_dropped = report.terminals_dropped,
                    credentials_pruned = report.credentials_pruned,
                    "Background sweep completed"
                );
            }
        }
    })
}
