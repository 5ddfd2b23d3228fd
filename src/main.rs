//! fleet-forge daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!   subscriptions ──▶ subscription resolver ──┐
//!                                             ▼
//!   model.json ◀──▶ model store (ArcSwap snapshots, versioned)
//!                                             │
//!                                             ▼
//!                          rule resolution → compilers → artifacts
//!                                             │
//!                                             ▼
//!   admin API / fleet-cli ──▶ dispatcher ──▶ agents (push, commands, logs)
//!                                  ▲
//!                              heartbeat
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use fleet_forge::admin::{self, AppState};
use fleet_forge::config::{check_config, read_config, FleetConfig};
use fleet_forge::lifecycle::signals;
use fleet_forge::observability::{logging, metrics};
use fleet_forge::{Services, Shutdown};

#[derive(Parser)]
#[command(name = "fleet-forge", version, about = "Proxy fleet control plane")]
struct Args {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Admin API key; overrides `admin.api_key` from the file.
    #[arg(long, env = "FLEET_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => read_config(path)?,
        None => FleetConfig::default(),
    };
    if let Some(key) = args.api_key.clone() {
        config.admin.api_key = key;
    }
    let config = check_config(config)?;

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fleet-forge starting");
    if args.config.is_none() {
        tracing::warn!("No configuration file given, running with defaults");
    }

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let services = Services::from_config(config)?;
    tracing::info!(
        bind_address = %services.config.admin.bind_address,
        store = %services.config.store.path,
        model_version = services.store.version(),
        "Configuration loaded"
    );

    let shutdown = Shutdown::new();
    let _watcher = services.watch_model(&shutdown)?;
    let heartbeat = services.spawn_heartbeat(&shutdown);
    signals::spawn_handler(shutdown.clone());

    let listener = TcpListener::bind(&services.config.admin.bind_address).await?;
    admin::serve(listener, AppState::new(&services), &shutdown).await?;

    shutdown.trigger();
    if let Err(e) = heartbeat.await {
        tracing::warn!(error = %e, "Heartbeat task ended abnormally");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
