//! Streaming session variant.
//!
//! A device opens one WebSocket, authenticates with its API key in the first
//! frame, and from then on commands are pushed instead of polled. Session
//! states only ever move forward: unauthenticated, authenticated, closed.
//! Teardown -- graceful or not -- marks the device offline and drops its
//! mailbox subscription.

use std::collections::HashMap;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetlink_hub::{Command, CommandOutcome};

use crate::state::AppState;

/// Frames a device sends over the streaming session.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "AUTH")]
    Auth { api_key: String },
    #[serde(rename = "STATUS")]
    Status {
        ip_address: Option<String>,
        #[serde(flatten)]
        metadata: HashMap<String, serde_json::Value>,
    },
    #[serde(rename = "ACK")]
    Ack {
        command_id: String,
        status: CommandOutcome,
    },
}

/// Frames the gateway pushes to a device.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "AUTH_SUCCESS")]
    AuthSuccess { device_id: String },
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed,
    #[serde(rename = "COMMAND")]
    Command {
        command_id: String,
        action: String,
        payload: serde_json::Value,
    },
}

impl From<Command> for ServerFrame {
    fn from(cmd: Command) -> Self {
        Self::Command {
            command_id: cmd.command_id,
            action: cmd.action,
            payload: cmd.payload,
        }
    }
}

/// `GET /ws/device` -- upgrade to a streaming device session.
pub async fn device_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // The first frame must authenticate; anything else closes the session.
    // Failures get the same terse AUTH_FAILED regardless of cause.
    let Some(Ok(Message::Text(first))) = stream.next().await else {
        debug!("Streaming session closed before authentication");
        return;
    };
    let device_id = match serde_json::from_str::<ClientFrame>(first.as_str()) {
        Ok(ClientFrame::Auth { api_key }) => match state.hub.authenticate(&api_key).await {
            Ok(identity) => identity.device_id,
            Err(_) => {
                let _ = send_frame(&mut sink, &ServerFrame::AuthFailed).await;
                let _ = sink.close().await;
                return;
            }
        },
        _ => {
            warn!("Streaming session opened with a non-AUTH frame");
            let _ = sink.close().await;
            return;
        }
    };

    // Presence and the subscription are in place before the device is told
    // the handshake succeeded, so AUTH_SUCCESS implies online.
    state
        .hub
        .session_contact(&device_id, None, &HashMap::new())
        .await;
    let (subscription, mut commands) = state.hub.subscribe_commands(&device_id).await;

    if send_frame(
        &mut sink,
        &ServerFrame::AuthSuccess {
            device_id: device_id.clone(),
        },
    )
    .await
    .is_err()
    {
        state.hub.session_closed(&device_id, subscription).await;
        return;
    }
    info!(device_id, "Streaming session authenticated");

    loop {
        tokio::select! {
            // Mailbox push: enqueued commands go out immediately
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    // Subscription replaced by a newer session for this device
                    debug!(device_id, "Mailbox subscription superseded");
                    break;
                };
                if send_frame(&mut sink, &ServerFrame::from(cmd)).await.is_err() {
                    break;
                }
            }
            // Inbound device frames
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, &device_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered at the protocol level; binary is not
                    // part of the device protocol.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.session_closed(&device_id, subscription).await;
    info!(device_id, "Streaming session closed");
}

async fn handle_client_frame(state: &AppState, device_id: &str, raw: &str) {
    match serde_json::from_str::<ClientFrame>(raw) {
        Ok(ClientFrame::Status {
            ip_address,
            metadata,
        }) => {
            state
                .hub
                .session_contact(device_id, ip_address.as_deref(), &metadata)
                .await;
        }
        Ok(ClientFrame::Ack { command_id, status }) => {
            state.hub.session_ack(device_id, &command_id, status).await;
        }
        // A second AUTH on an authenticated session is meaningless
        Ok(ClientFrame::Auth { .. }) => {
            debug!(device_id, "Ignoring AUTH frame on authenticated session");
        }
        Err(err) => {
            debug!(device_id, %err, "Ignoring malformed session frame");
        }
    }
}

async fn send_frame(
    sink: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sink.send(Message::Text(text.into())).await
}
