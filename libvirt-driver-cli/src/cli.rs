//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use libvirt_driver::config::SSH_USER_ENV;
use serde::Deserialize;

/// libvirt machine driver - Provision and manage a single libvirt/KVM machine
#[derive(Parser, Debug)]
#[command(name = "libvirt-driver")]
#[command(about = "libvirt machine driver - Provision and manage a single libvirt/KVM machine")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    pub log_format: String,

    /// Hypervisor backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,

    // ========================================================================
    // Machine settings
    // ========================================================================

    /// Machine name
    #[arg(long)]
    pub machine_name: Option<String>,

    /// Store directory holding machines/<name>/
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    /// Base disk image the machine disk is layered on
    #[arg(long)]
    pub image_source: Option<PathBuf>,

    /// Size of memory for the host in MiB
    #[arg(long)]
    pub memory: Option<u64>,

    /// Number of CPUs
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Name of the network to connect to (empty for none)
    #[arg(long)]
    pub network: Option<String>,

    /// Name of the storage pool to use
    #[arg(long)]
    pub storage_pool: Option<String>,

    /// Disk cache mode: default, none, writethrough, writeback, directsync or unsafe
    #[arg(long)]
    pub cache_mode: Option<String>,

    /// Disk IO mode: threads or native
    #[arg(long)]
    pub io_mode: Option<String>,

    /// SSH username
    #[arg(long, env = SSH_USER_ENV)]
    pub ssh_user: Option<String>,

    /// Attach a virtio vsock device
    #[arg(long)]
    pub vsock: bool,

    /// Libvirt connection URI
    #[arg(long)]
    pub connect: Option<String>,

    /// Directory holding the dnsmasq lease files
    #[arg(long)]
    pub leases_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Driver operations.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Provision the disk, define the machine and start it
    Create,
    /// Start the machine and wait for its IP address
    Start,
    /// Gracefully stop the machine
    Stop,
    /// Stop then start the machine
    Restart,
    /// Power the machine off immediately
    Kill,
    /// Undefine the machine, keeping its disk
    Remove,
    /// Print the machine state
    State,
    /// Print the machine IP address
    Ip,
    /// Print the SSH connection details as JSON
    SshInfo,
    /// Apply a new JSON configuration to the machine
    Update {
        /// JSON file to read (stdin if omitted)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Check that the hypervisor, network and storage pool are usable
    PreCreateCheck,
    /// Print the driver name and version
    Version,
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native libvirt connection (requires the `libvirt` feature)
    Libvirt,
    /// Shell out to virsh
    Virsh,
    /// In-memory hypervisor for development
    Mock,
}

impl Default for BackendKind {
    /// The native backend when compiled in, virsh otherwise.
    fn default() -> Self {
        if libvirt_driver::backend::native_available() {
            Self::Libvirt
        } else {
            Self::Virsh
        }
    }
}
