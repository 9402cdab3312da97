//! # libvirt machine driver
//!
//! Command-line front end of the libvirt machine driver. Each subcommand runs
//! one driver operation against the configured machine and exits.
//!
//! ## Usage
//! ```bash
//! libvirt-driver --config /etc/libvirt-driver/crc.yaml create
//! libvirt-driver --machine-name crc --store-path ~/.crc ip
//! ```

use anyhow::Result;
use clap::Parser;
use libvirt_driver_common::LogFormat;
use tracing::{debug, error, info};

mod cli;
mod commands;
mod config;

use cli::Args;
use config::Config;

const DEFAULT_CONFIG_PATH: &str = "/etc/libvirt-driver/driver.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    match args.log_format.parse::<LogFormat>()? {
        LogFormat::Text => libvirt_driver_common::init_logging(&args.log_level)?,
        LogFormat::Json => libvirt_driver_common::init_logging_json(&args.log_level)?,
    }

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?args.command,
        "Starting libvirt machine driver"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)?
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(&args)?
            }
            Err(_) => {
                debug!("No config file found, using CLI arguments and defaults");
                Config::default_with_cli(&args)?
            }
        },
    };

    debug!(
        machine = %config.machine.machine_name,
        backend = ?config.backend,
        uri = %config.machine.connection_uri,
        "Driver configured"
    );

    if let Err(e) = commands::run(config, &args.command).await {
        error!(error = %e, command = ?args.command, "Command failed");
        return Err(e);
    }

    Ok(())
}
