//! HTTP/WS surface of the gateway.

pub mod control_api;
pub mod device_api;
pub mod stream;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tracing::error;

use fleetlink_hub::HubError;

use crate::state::AppState;

/// Build the gateway router with all endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Device-facing poll API, API key in headers
        .route("/api/device/status", post(device_api::report_status))
        .route("/api/device/commands", get(device_api::poll_command))
        .route("/api/device/confirm", post(device_api::confirm_command))
        // Control-plane API, user identity supplied by the fronting web layer
        .route(
            "/api/devices/{device_id}/control",
            post(control_api::control_device),
        )
        .route(
            "/api/devices/{device_id}/status",
            get(control_api::device_status),
        )
        // Streaming variant
        .route("/ws/device", get(stream::device_ws))
        .with_state(state)
}

/// Pull the device credential out of `X-API-Key` or `Authorization: Bearer`,
/// the two header forms the original firmware sends.
pub(crate) fn credential_from(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Hub error mapped onto a wire response.
///
/// `Unauthorized` and `DeviceNotEligible` are byte-identical on the wire so
/// registry state never leaks to untrusted clients; registry failures are
/// logged with context and surfaced as a bare 500.
pub(crate) struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            HubError::Unauthorized | HubError::DeviceNotEligible(_) => (
                StatusCode::UNAUTHORIZED,
                axum::Json(json!({"error": "Invalid API key"})),
            )
                .into_response(),
            HubError::DeviceNotFound(_) => (
                StatusCode::NOT_FOUND,
                axum::Json(json!({"success": false, "message": "Device not found"})),
            )
                .into_response(),
            HubError::QueueFull(device_id) => {
                error!(device_id, "Rejected enqueue: too many pending commands");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    axum::Json(
                        json!({"success": false, "message": "Too many pending commands"}),
                    ),
                )
                    .into_response()
            }
            HubError::Registry(reason) => {
                error!(reason, "Registry failure while handling request");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
