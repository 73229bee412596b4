//! `Fleetlink` Core Library
//!
//! Shared functionality for `Fleetlink` components:
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{Error, Result};
