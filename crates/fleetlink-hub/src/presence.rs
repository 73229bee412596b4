//! Per-device presence tracking.
//!
//! A device is online while its last inbound contact is within the liveness
//! window. Liveness is always evaluated against the clock at read time, so a
//! device can never appear online forever off a stale flag; the sweeper only
//! exists to flip the stored flag and log the transition.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use fleetlink_core::config::PresenceConfig;

use crate::types::PresenceSnapshot;

struct PresenceRecord {
    is_online: bool,
    last_seen: Instant,
    last_ip: Option<String>,
    signal_metadata: HashMap<String, serde_json::Value>,
}

/// Tracks online/offline state and last-known network metadata per device.
pub struct PresenceTracker {
    records: RwLock<HashMap<String, PresenceRecord>>,
    liveness_window: Duration,
}

impl PresenceTracker {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            liveness_window: Duration::from_secs(config.liveness_window_secs),
        }
    }

    /// Record inbound contact from a device. Idempotent; always succeeds.
    ///
    /// Creates the record on first contact, refreshes `last_seen`, merges the
    /// reported metadata, and flips the device online.
    pub async fn touch(
        &self,
        device_id: &str,
        ip: Option<&str>,
        metadata: &HashMap<String, serde_json::Value>,
    ) {
        let mut records = self.records.write().await;
        let record = records
            .entry(device_id.to_string())
            .or_insert_with(|| PresenceRecord {
                is_online: false,
                last_seen: Instant::now(),
                last_ip: None,
                signal_metadata: HashMap::new(),
            });
        if !record.is_online {
            info!(device_id, "Device online");
        }
        record.is_online = true;
        record.last_seen = Instant::now();
        if let Some(ip) = ip {
            record.last_ip = Some(ip.to_string());
        }
        for (key, value) in metadata {
            record.signal_metadata.insert(key.clone(), value.clone());
        }
    }

    /// Whether the device has been heard from within the liveness window.
    /// Evaluated live; never reads a stale flag.
    pub async fn is_alive(&self, device_id: &str) -> bool {
        self.records
            .read()
            .await
            .get(device_id)
            .is_some_and(|r| r.is_online && r.last_seen.elapsed() <= self.liveness_window)
    }

    /// Explicitly flip a device offline (transport disconnect).
    pub async fn mark_offline(&self, device_id: &str) {
        if let Some(record) = self.records.write().await.get_mut(device_id)
            && record.is_online
        {
            record.is_online = false;
            info!(device_id, "Device offline");
        }
    }

    /// Presence view for the control plane. `None` for devices never heard
    /// from, with `is_online` recomputed against the window.
    pub async fn snapshot(&self, device_id: &str) -> Option<PresenceSnapshot> {
        let records = self.records.read().await;
        let record = records.get(device_id)?;
        Some(PresenceSnapshot {
            is_online: record.is_online && record.last_seen.elapsed() <= self.liveness_window,
            last_seen: Some(record.last_seen),
            last_ip: record.last_ip.clone(),
            signal_metadata: record.signal_metadata.clone(),
        })
    }

    /// Flip the stored flag for devices past the liveness window. Returns
    /// the ids that went offline in this pass.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let mut records = self.records.write().await;
        let mut went_offline = Vec::new();
        for (device_id, record) in records.iter_mut() {
            if record.is_online && record.last_seen.elapsed() > self.liveness_window {
                record.is_online = false;
                debug!(device_id, "Device missed liveness window");
                went_offline.push(device_id.clone());
            }
        }
        if !went_offline.is_empty() {
            info!(count = went_offline.len(), "Swept stale devices offline");
        }
        went_offline
    }
}
