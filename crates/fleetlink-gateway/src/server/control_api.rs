//! Control-plane endpoints.
//!
//! These are called by the web dashboard on behalf of a logged-in user. The
//! fronting web layer owns session authentication and passes the resolved
//! user id in `X-User-Id`; a request without it is unauthorized.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use fleetlink_hub::HubError;

use super::ApiError;
use crate::state::AppState;

fn user_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// `POST /api/devices/{device_id}/control` -- queue a command for a device
/// the requesting user owns.
pub async fn control_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ControlRequest>,
) -> Result<Response, ApiError> {
    let user_id = user_from(&headers).ok_or(HubError::Unauthorized)?;

    let payload = match &body.value {
        Some(value) => json!({ "value": value }),
        None => json!({}),
    };
    let command_id = state
        .hub
        .issue_command(&user_id, &device_id, &body.action, payload)
        .await?;
    info!(device_id, user_id, action = %body.action, "Control command queued");

    Ok(Json(json!({
        "success": true,
        "message": format!("Command queued: {}", body.action),
        "command_id": command_id,
    }))
    .into_response())
}

/// `GET /api/devices/{device_id}/status` -- presence view for the dashboard.
pub async fn device_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = user_from(&headers).ok_or(HubError::Unauthorized)?;

    let status = state.hub.device_status(&user_id, &device_id).await?;

    Ok(Json(json!({
        "success": true,
        "device_id": status.device_id,
        "is_online": status.is_online,
        "last_seen_secs": status.last_seen_secs,
        "ip_address": status.last_ip,
        "signal": status.signal_metadata,
        "pending_commands": status.pending_commands,
    }))
    .into_response())
}
