//! Fleetlink Gateway
//!
//! HTTP/WebSocket session gateway for the device fleet: devices poll (or
//! stream) commands and report status, the control plane issues commands.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::info;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetlink_core::config::load_config;
use fleetlink_gateway::sweeper::spawn_sweeper;
use fleetlink_gateway::{AppState, server};
use fleetlink_hub::{AuthState, DeviceHub, DeviceRegistry, StaticRegistry};

#[derive(Parser, Debug)]
#[command(name = "fleetlink-gateway")]
#[command(
    version,
    about = "Fleetlink gateway - device command mailbox and presence tracker"
)]
struct Args {
    /// Address to listen on. Overrides the config file.
    #[arg(long, env = "FLEETLINK_LISTEN_ADDR")]
    addr: Option<SocketAddr>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a JSON file of device records to seed the registry with.
    #[arg(long, env = "FLEETLINK_REGISTRY_FILE")]
    registry_file: Option<PathBuf>,

    /// Liveness window in seconds. Overrides the config file.
    #[arg(long)]
    liveness_window: Option<u64>,

    /// Delivery timeout in seconds. Overrides the config file.
    #[arg(long)]
    delivery_timeout: Option<u64>,

    /// Per-device queued-command cap. Overrides the config file.
    #[arg(long)]
    queue_cap: Option<usize>,

    /// Background sweep interval in seconds. Overrides the config file.
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

/// One line of the `--registry-file` seed format.
#[derive(Debug, Deserialize)]
struct SeedRecord {
    device_id: String,
    owner_id: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    status: Option<AuthState>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.gateway.listen_addr = addr.to_string();
    }
    if let Some(secs) = args.liveness_window {
        config.presence.liveness_window_secs = secs;
    }
    if let Some(secs) = args.delivery_timeout {
        config.mailbox.delivery_timeout_secs = secs;
    }
    if let Some(cap) = args.queue_cap {
        config.mailbox.queue_cap = cap;
    }
    if let Some(secs) = args.sweep_interval {
        config.gateway.sweep_interval_secs = secs;
    }

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| {
            format!(
                "fleetlink_gateway={level},fleetlink_hub={level}",
                level = config.gateway.log_level
            )
        }),
    );
    if args.log_json || config.gateway.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.gateway.listen_addr,
        "Starting fleetlink-gateway"
    );

    let registry = StaticRegistry::new();
    if let Some(path) = &args.registry_file {
        let seeded = seed_registry(&registry, path).await?;
        info!(path = %path.display(), devices = seeded, "Registry seeded from file");
    }

    let hub = Arc::new(DeviceHub::new(
        Arc::new(registry) as Arc<dyn DeviceRegistry>,
        &config,
    ));
    let state = AppState::new(Arc::clone(&hub));
    let app = server::router(state);

    spawn_sweeper(
        Arc::clone(&hub),
        Duration::from_secs(config.gateway.sweep_interval_secs),
    );

    let listener = tokio::net::TcpListener::bind(&config.gateway.listen_addr).await?;
    info!(addr = %config.gateway.listen_addr, "Gateway listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Gateway stopped");
    Ok(())
}

async fn seed_registry(registry: &StaticRegistry, path: &Path) -> anyhow::Result<usize> {
    let content = tokio::fs::read_to_string(path).await?;
    let records: Vec<SeedRecord> = serde_json::from_str(&content)?;
    let count = records.len();
    for record in records {
        registry
            .seed(
                &record.device_id,
                &record.owner_id,
                record.status.unwrap_or(AuthState::Approved),
                record.api_key,
            )
            .await;
    }
    Ok(count)
}
