//! Homenet bridge - RS-485 apartment bus to Home Assistant MQTT
//!
//! Bridges one or more vendor-specific serial buses (Samsung SDS, Kocom,
//! Commax, EZVille, Hyundai Imazu, CVnet wall pads) onto an MQTT broker
//! speaking the Home Assistant discovery convention.
//!
//! Module structure:
//! - `domain/` - Packet schemas, checksums, the expression dialect
//! - `io/` - External interfaces (MQTT, serial/TCP transport)
//! - `services/` - Port engines (framer, state, command, discovery, automation)
//! - `infra/` - Infrastructure (config, event bus, counters)

use clap::Parser;
use homenet_bridge::infra::{BridgeConfig, EventBus};
use homenet_bridge::io::mqtt;
use homenet_bridge::services::BridgeSupervisor;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Homenet bridge - RS-485 wall pad to MQTT/Home Assistant
#[derive(Parser, Debug)]
#[command(name = "homenet-bridge", version, about)]
struct Args {
    /// Path to YAML configuration file (defaults to CONFIG_ROOT or
    /// config/homenet_bridge.yaml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = option_env!("GIT_HASH").unwrap_or("unknown"),
        "homenet_bridge_starting"
    );

    let args = Args::parse();
    let config_path = BridgeConfig::resolve_config_path(args.config.as_deref());

    let config = match BridgeConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(config_file = %config_path, error = %format!("{e:#}"), "config_load_failed");
            return std::process::ExitCode::FAILURE;
        }
    };
    info!(
        config_file = %config_path,
        ports = %config.ports.len(),
        mqtt_url = %config.settings.mqtt_url,
        prefix = %config.settings.prefix,
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bus = EventBus::new();
    let mqtt = match mqtt::start(&config.settings, bus.clone(), shutdown_rx.clone()).await {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            error!(error = %format!("{e:#}"), "mqtt_connect_failed");
            return std::process::ExitCode::FAILURE;
        }
    };

    let supervisor = BridgeSupervisor::new(config, mqtt, bus);

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run all port engines until shutdown
    supervisor.run(shutdown_rx).await;

    info!("homenet-bridge shutdown complete");
    std::process::ExitCode::SUCCESS
}
