//! Device-facing poll endpoints.
//!
//! The firmware authenticates every request with its API key header; there
//! is no session. A poll with no pending command is a 204, not an error.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use fleetlink_hub::{Command, CommandOutcome, HubError};

use super::{ApiError, credential_from};
use crate::state::AppState;

/// Command as handed to a device.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command_id: String,
    pub action: String,
    pub payload: serde_json::Value,
}

impl From<Command> for CommandFrame {
    fn from(cmd: Command) -> Self {
        Self {
            command_id: cmd.command_id,
            action: cmd.action,
            payload: cmd.payload,
        }
    }
}

/// `POST /api/device/status` -- inbound status report.
///
/// The body is an open object: `ip_address` is pulled out, every other
/// field (rssi, led_state, ...) is kept as opaque signal metadata.
pub async fn report_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Response, ApiError> {
    let credential = credential_from(&headers).ok_or(HubError::Unauthorized)?;

    let ip = body.get("ip_address").and_then(|v| v.as_str()).map(String::from);
    let metadata: HashMap<String, serde_json::Value> = body
        .into_iter()
        .filter(|(key, _)| key != "ip_address")
        .collect();

    let identity = state
        .hub
        .report_status(&credential, ip.as_deref(), &metadata)
        .await?;
    info!(device_id = %identity.device_id, "Status report received");

    Ok(Json(json!({
        "status": "success",
        "message": "Status received",
        "timestamp": unix_now(),
    }))
    .into_response())
}

/// `GET /api/device/commands` -- pull the next pending command.
/// 200 with the command, or 204 when the mailbox has nothing deliverable.
pub async fn poll_command(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let credential = credential_from(&headers).ok_or(HubError::Unauthorized)?;

    match state.hub.next_command(&credential).await? {
        Some(cmd) => Ok(Json(CommandFrame::from(cmd)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub command_id: String,
    /// Execution outcome as reported by the firmware.
    pub status: CommandOutcome,
}

/// `POST /api/device/confirm` -- acknowledge a delivered command.
/// Always 200 for a valid credential; duplicate confirms are no-ops.
pub async fn confirm_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConfirmRequest>,
) -> Result<Response, ApiError> {
    let credential = credential_from(&headers).ok_or(HubError::Unauthorized)?;

    state
        .hub
        .confirm(&credential, &body.command_id, body.status)
        .await?;

    Ok(Json(json!({"status": "confirmed"})).into_response())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
