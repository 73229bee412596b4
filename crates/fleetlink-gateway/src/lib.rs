//! Fleetlink session gateway library.
//!
//! The protocol-facing half of fleetlink: an axum HTTP API for polling
//! devices and the control plane, an optional WebSocket streaming session,
//! and the background sweeper. All domain decisions live in `fleetlink-hub`;
//! this crate only maps them onto the wire.

pub mod server;
pub mod state;
pub mod sweeper;

pub use state::AppState;
