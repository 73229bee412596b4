//! Configuration resolution for Fleetlink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/fleetlink/settings.json)
//! 3. Explicit config file (--config)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Fleetlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Gateway-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the HTTP/WS listener binds to.
    pub listen_addr: String,
    /// Interval between background sweep passes (seconds).
    pub sweep_interval_secs: u64,
    pub log_level: String,
    /// Emit structured JSON log lines instead of the human-readable format.
    pub log_json: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            sweep_interval_secs: 30,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Presence tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// A device with no inbound contact for this long is considered offline.
    pub liveness_window_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: 300, // 5 minutes
        }
    }
}

/// Command mailbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Soft cap on queued commands per device; enqueue beyond this is rejected.
    pub queue_cap: usize,
    /// A delivered command unacknowledged for this long expires (seconds).
    pub delivery_timeout_secs: u64,
    /// How long terminal commands are retained for duplicate-ack tolerance (seconds).
    pub terminal_retention_secs: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            queue_cap: 50,
            delivery_timeout_secs: 60,
            terminal_retention_secs: 300,
        }
    }
}

/// Identity resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// TTL for cached credential lookups (seconds). Bounds revocation staleness.
    pub cache_ttl_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 120, // 2 minutes
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(config_file: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Load explicit config file
    if let Some(path) = config_file {
        let explicit = load_config_file(path)?;
        merge_config(&mut config, explicit);
    }

    // Apply environment overrides
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
        .map(|p| p.join("fleetlink").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.gateway = overlay.gateway;
    base.presence = overlay.presence;
    base.mailbox = overlay.mailbox;
    base.identity = overlay.identity;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("FLEETLINK_LISTEN_ADDR") {
        config.gateway.listen_addr = val;
    }
    if let Ok(val) = std::env::var("FLEETLINK_LOG_LEVEL") {
        config.gateway.log_level = val;
    }
    if let Ok(val) = std::env::var("FLEETLINK_LIVENESS_WINDOW_SECS")
        && let Ok(n) = val.parse()
    {
        config.presence.liveness_window_secs = n;
    }
    if let Ok(val) = std::env::var("FLEETLINK_DELIVERY_TIMEOUT_SECS")
        && let Ok(n) = val.parse()
    {
        config.mailbox.delivery_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("FLEETLINK_QUEUE_CAP")
        && let Ok(n) = val.parse()
    {
        config.mailbox.queue_cap = n;
    }
}
