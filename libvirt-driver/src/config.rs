//! Driver configuration.
//!
//! [`DriverConfig`] is both the in-memory settings of a driver instance and
//! the JSON document exchanged with the orchestrating tool, so every field
//! has a default and unknown fields are ignored.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};
use crate::types::{DiskCacheMode, DiskIoMode};

pub const DRIVER_NAME: &str = "libvirt";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_CONNECTION_URI: &str = "qemu:///system";
pub const DEFAULT_MEMORY_MIB: u64 = 8096;
pub const DEFAULT_CPUS: u32 = 4;
pub const DEFAULT_NETWORK: &str = "crc";
pub const DEFAULT_POOL: &str = "crc";
pub const DEFAULT_SSH_USER: &str = "core";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_IMAGE_FORMAT: &str = "qcow2";
pub const DEFAULT_LEASES_DIR: &str = "/var/lib/libvirt/dnsmasq";

/// Environment variable overriding the SSH username.
pub const SSH_USER_ENV: &str = "CRC_LIBVIRT_SSHUSER";

/// Settings of one managed machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Machine name; also the domain name and the volume name stem
    pub machine_name: String,
    /// Root of the framework's store directory
    pub store_path: PathBuf,
    /// Guest memory in MiB
    pub memory_mib: u64,
    /// Number of vCPUs
    pub cpus: u32,
    /// Virtual network to attach to (empty disables networking)
    pub network: String,
    /// Storage pool holding the disk image (empty falls back to the machine name)
    pub storage_pool: String,
    pub cache_mode: DiskCacheMode,
    pub io_mode: DiskIoMode,
    /// Base image the machine disk is layered on
    pub image_source_path: PathBuf,
    /// Disk image format, only qcow2 is supported
    pub image_format: String,
    /// Requested disk capacity in bytes (0 = keep the image size)
    pub disk_capacity: u64,
    /// Attach a virtio vsock device
    pub vsock: bool,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_key_path: String,
    /// Last address the machine was seen with
    pub ip_address: String,
    /// Hypervisor connection URI
    pub connection_uri: String,
    /// Directory holding the dnsmasq `<bridge>.status` lease files
    pub leases_dir: PathBuf,
    /// How to create the network when it is missing and the backend allows it
    pub network_definition: Option<NetworkDefinition>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            machine_name: String::new(),
            store_path: PathBuf::new(),
            memory_mib: DEFAULT_MEMORY_MIB,
            cpus: DEFAULT_CPUS,
            network: DEFAULT_NETWORK.to_string(),
            storage_pool: DEFAULT_POOL.to_string(),
            cache_mode: DiskCacheMode::Default,
            io_mode: DiskIoMode::Threads,
            image_source_path: PathBuf::new(),
            image_format: DEFAULT_IMAGE_FORMAT.to_string(),
            disk_capacity: 0,
            vsock: false,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_key_path: String::new(),
            ip_address: String::new(),
            connection_uri: DEFAULT_CONNECTION_URI.to_string(),
            leases_dir: PathBuf::from(DEFAULT_LEASES_DIR),
            network_definition: None,
        }
    }
}

impl DriverConfig {
    /// Create a configuration for the named machine with default settings.
    pub fn new(machine_name: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            machine_name: machine_name.into(),
            store_path: store_path.into(),
            ..Default::default()
        }
    }

    /// Set the memory size in MiB.
    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    /// Set the number of vCPUs.
    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    /// Set the network name (empty disables networking).
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Set the base image path.
    pub fn with_image_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_source_path = path.into();
        self
    }

    /// Resolve a file name inside this machine's store directory.
    pub fn resolve_store_path(&self, file: impl AsRef<Path>) -> PathBuf {
        self.store_path
            .join("machines")
            .join(&self.machine_name)
            .join(file)
    }

    /// Directory holding the disk image and the marker file.
    pub fn machine_dir(&self) -> PathBuf {
        self.store_path.join("machines").join(&self.machine_name)
    }

    /// Volume name of the disk image inside the storage pool.
    pub fn disk_image_filename(&self) -> String {
        format!("{}.{}", self.machine_name, self.image_format)
    }

    /// Absolute path of the disk image.
    pub fn disk_image_path(&self) -> PathBuf {
        self.resolve_store_path(self.disk_image_filename())
    }

    /// Storage pool name: explicit pool, else machine name, else the default.
    ///
    /// Pools provisioned by older releases were named after the machine, so
    /// the order must not change.
    pub fn storage_pool_name(&self) -> &str {
        if !self.storage_pool.is_empty() {
            &self.storage_pool
        } else if !self.machine_name.is_empty() {
            &self.machine_name
        } else {
            DEFAULT_POOL
        }
    }

    /// SSH port, falling back to 22 when unset.
    pub fn ssh_port(&self) -> u16 {
        if self.ssh_port == 0 {
            DEFAULT_SSH_PORT
        } else {
            self.ssh_port
        }
    }

    /// SSH username, falling back to `core` when unset.
    pub fn ssh_user(&self) -> &str {
        if self.ssh_user.is_empty() {
            DEFAULT_SSH_USER
        } else {
            &self.ssh_user
        }
    }

    /// Check the settings needed to define a domain.
    pub fn validate(&self) -> Result<()> {
        if self.machine_name.is_empty() {
            return Err(DriverError::InvalidConfig("machine name must not be empty".into()));
        }
        if self.memory_mib == 0 {
            return Err(DriverError::InvalidConfig("memory must be positive".into()));
        }
        if self.cpus == 0 {
            return Err(DriverError::InvalidConfig("CPU count must be positive".into()));
        }
        if self.image_format != DEFAULT_IMAGE_FORMAT {
            return Err(DriverError::InvalidConfig(format!(
                "Unsupported VM image format: {}",
                self.image_format
            )));
        }
        if !self.image_source_path.is_file() {
            return Err(DriverError::InvalidConfig(format!(
                "disk image source {} does not exist or is not a file",
                self.image_source_path.display()
            )));
        }
        Ok(())
    }
}

/// Layout of a NAT network the driver may define itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// Host bridge device, e.g. `crc`
    pub bridge: String,
    /// Host-side gateway address
    pub address: String,
    pub prefix: u8,
    pub dhcp_start: String,
    pub dhcp_end: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::new("crc", "/home/user/.crc");
        assert_eq!(config.memory_mib, 8096);
        assert_eq!(config.cpus, 4);
        assert_eq!(config.network, "crc");
        assert_eq!(config.storage_pool, "crc");
        assert_eq!(config.cache_mode, DiskCacheMode::Default);
        assert_eq!(config.io_mode, DiskIoMode::Threads);
        assert_eq!(config.ssh_user(), "core");
        assert_eq!(config.ssh_port(), 22);
        assert_eq!(config.connection_uri, "qemu:///system");
    }

    #[test]
    fn test_pool_name_explicit() {
        let mut config = DriverConfig::new("machine", "/store");
        config.storage_pool = "custom".to_string();
        assert_eq!(config.storage_pool_name(), "custom");
    }

    #[test]
    fn test_pool_name_falls_back_to_machine_name() {
        let mut config = DriverConfig::new("machine", "/store");
        config.storage_pool.clear();
        assert_eq!(config.storage_pool_name(), "machine");
    }

    #[test]
    fn test_pool_name_falls_back_to_default() {
        let mut config = DriverConfig::new("", "/store");
        config.storage_pool.clear();
        assert_eq!(config.storage_pool_name(), DEFAULT_POOL);
    }

    #[test]
    fn test_store_paths() {
        let config = DriverConfig::new("domain", "/store");
        assert_eq!(config.machine_dir(), PathBuf::from("/store/machines/domain"));
        assert_eq!(
            config.disk_image_path(),
            PathBuf::from("/store/machines/domain/domain.qcow2")
        );
        assert_eq!(config.disk_image_filename(), "domain.qcow2");
    }

    #[test]
    fn test_zero_ssh_settings_fall_back() {
        let mut config = DriverConfig::new("crc", "/store");
        config.ssh_port = 0;
        config.ssh_user.clear();
        assert_eq!(config.ssh_port(), 22);
        assert_eq!(config.ssh_user(), "core");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DriverConfig =
            serde_json::from_str(r#"{"machine_name": "crc", "memory_mib": 4096}"#).unwrap();
        assert_eq!(config.memory_mib, 4096);
        assert_eq!(config.cpus, DEFAULT_CPUS);
        assert_eq!(config.cache_mode, DiskCacheMode::Default);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("base.qcow2");
        std::fs::write(&image, b"qcow").unwrap();

        let config = DriverConfig::new("crc", dir.path()).with_image_source(&image);
        assert!(config.validate().is_ok());

        assert!(config.clone().with_memory(0).validate().is_err());
        assert!(config.clone().with_cpus(0).validate().is_err());

        let mut raw = config.clone();
        raw.image_format = "raw".to_string();
        let err = raw.validate().unwrap_err();
        assert!(err.to_string().contains("Unsupported VM image format: raw"));

        let missing = config.with_image_source(dir.path().join("missing.qcow2"));
        assert!(missing.validate().is_err());
    }
}
