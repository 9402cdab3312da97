//! Subcommand dispatch.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use libvirt_driver::mock::DHCP_NETWORK_XML;
use libvirt_driver::{Driver, DriverConfig, Hypervisor, MockBackend, VirshBackend};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::cli::{BackendKind, Command};
use crate::config::Config;

/// SSH connection details of the machine.
#[derive(Debug, Serialize)]
struct SshInfo {
    hostname: String,
    port: u16,
    user: String,
    key_path: String,
}

/// Build the hypervisor backend selected in the configuration.
pub fn connect(config: &Config) -> Result<Arc<dyn Hypervisor>> {
    let uri = &config.machine.connection_uri;
    match config.backend {
        BackendKind::Libvirt => native_backend(uri),
        BackendKind::Virsh => {
            info!(uri = %uri, "Using virsh backend");
            Ok(Arc::new(VirshBackend::new(uri.as_str())))
        }
        BackendKind::Mock => {
            warn!("Using mock hypervisor (development mode)");
            Ok(Arc::new(dev_backend(&config.machine)))
        }
    }
}

#[cfg(feature = "libvirt")]
fn native_backend(uri: &str) -> Result<Arc<dyn Hypervisor>> {
    info!(uri = %uri, "Using libvirt backend");
    Ok(Arc::new(libvirt_driver::LibvirtBackend::new(uri)))
}

#[cfg(not(feature = "libvirt"))]
fn native_backend(_uri: &str) -> Result<Arc<dyn Hypervisor>> {
    anyhow::bail!("the libvirt backend is not compiled in, rebuild with --features libvirt or use --backend virsh")
}

/// Mock hypervisor with the configured network already in place.
fn dev_backend(machine: &DriverConfig) -> MockBackend {
    let mock = MockBackend::new();
    if !machine.network.is_empty() {
        mock.add_network(&machine.network, DHCP_NETWORK_XML, true, &machine.network);
    }
    mock
}

/// Run one subcommand against the configured machine.
pub async fn run(config: Config, command: &Command) -> Result<()> {
    let mut stdout = std::io::stdout();

    if *command == Command::Version {
        return print_version(&mut stdout);
    }

    let backend = connect(&config)?;
    let mut driver = Driver::new(config.machine, backend);
    execute(&mut driver, command, &mut stdout).await
}

fn print_version(out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "{} {} (native backend: {})",
        libvirt_driver::config::DRIVER_NAME,
        libvirt_driver::config::DRIVER_VERSION,
        if libvirt_driver::backend::native_available() { "yes" } else { "no" }
    )?;
    Ok(())
}

/// Execute `command` on `driver`, writing results to `out`.
///
/// Operations that change the recorded configuration (IP address, disk
/// capacity) print the resulting configuration as JSON so the caller can
/// persist it.
pub async fn execute(driver: &mut Driver, command: &Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Create => {
            driver.create().await.context("Failed to create machine")?;
            print_config(driver, out)?;
        }
        Command::Start => {
            driver.start().await.context("Failed to start machine")?;
            print_config(driver, out)?;
        }
        Command::Stop => driver.stop().await?,
        Command::Restart => {
            driver.restart().await?;
            print_config(driver, out)?;
        }
        Command::Kill => driver.kill().await?,
        Command::Remove => driver.remove().await?,
        Command::State => {
            let state = driver.get_state().await?;
            writeln!(out, "{}", state)?;
        }
        Command::Ip => {
            let ip = driver.get_ip().await?;
            writeln!(out, "{}", ip)?;
        }
        Command::SshInfo => {
            let info = SshInfo {
                hostname: driver.ssh_hostname().await?,
                port: driver.ssh_port(),
                user: driver.ssh_username().to_string(),
                key_path: driver.ssh_key_path().to_string(),
            };
            writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
        }
        Command::Update { file } => {
            let raw = read_payload(file.as_deref()).await?;
            driver.update_config_raw(&raw).await?;
            print_config(driver, out)?;
        }
        Command::PreCreateCheck => {
            driver.pre_create_check().await?;
            writeln!(out, "ok")?;
        }
        Command::Version => print_version(out)?,
    }
    Ok(())
}

fn print_config(driver: &Driver, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(driver.config())?)?;
    Ok(())
}

async fn read_payload(file: Option<&Path>) -> Result<Vec<u8>> {
    match file {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut raw = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut raw)
                .await
                .context("Failed to read configuration from stdin")?;
            Ok(raw)
        }
    }
}
