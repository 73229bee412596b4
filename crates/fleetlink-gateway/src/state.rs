//! State shared across all gateway handlers.

use std::sync::Arc;

use fleetlink_hub::DeviceHub;

/// Handler state: the device hub behind every endpoint.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<DeviceHub>,
}

impl AppState {
    pub fn new(hub: Arc<DeviceHub>) -> Self {
        Self { hub }
    }
}
