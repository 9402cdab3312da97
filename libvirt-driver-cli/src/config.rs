//! Configuration management for the driver binary.
//!
//! ```yaml
//! backend: virsh
//! machine:
//!   machine_name: crc
//!   store_path: /home/user/.crc
//!   memory_mib: 10752
//!   image_source_path: /home/user/.crc/cache/crc.qcow2
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use libvirt_driver::{DiskCacheMode, DiskIoMode, DriverConfig};
use serde::Deserialize;

use crate::cli::{Args, BackendKind};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor backend
    pub backend: BackendKind,
    /// Settings of the managed machine
    pub machine: DriverConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        let machine = &mut self.machine;

        if let Some(ref name) = args.machine_name {
            machine.machine_name = name.clone();
        }
        if let Some(ref store_path) = args.store_path {
            machine.store_path = store_path.clone();
        }
        if let Some(ref image) = args.image_source {
            machine.image_source_path = image.clone();
        }
        if let Some(memory) = args.memory {
            machine.memory_mib = memory;
        }
        if let Some(cpus) = args.cpus {
            machine.cpus = cpus;
        }
        if let Some(ref network) = args.network {
            machine.network = network.clone();
        }
        if let Some(ref pool) = args.storage_pool {
            machine.storage_pool = pool.clone();
        }
        if let Some(ref mode) = args.cache_mode {
            machine.cache_mode = mode.parse::<DiskCacheMode>()?;
        }
        if let Some(ref mode) = args.io_mode {
            machine.io_mode = mode.parse::<DiskIoMode>()?;
        }
        if let Some(ref user) = args.ssh_user {
            machine.ssh_user = user.clone();
        }
        if args.vsock {
            machine.vsock = true;
        }
        if let Some(ref uri) = args.connect {
            machine.connection_uri = uri.clone();
        }
        if let Some(ref dir) = args.leases_dir {
            machine.leases_dir = dir.clone();
        }

        if let Some(backend) = args.backend {
            self.backend = backend;
        }
        if args.dev {
            self.backend = BackendKind::Mock;
        }

        Ok(self)
    }

    /// Create config using only CLI arguments and defaults.
    pub fn default_with_cli(args: &Args) -> Result<Self> {
        Self::default().with_cli_overrides(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["libvirt-driver"];
        argv.extend_from_slice(extra);
        argv.push("state");
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.yaml");
        std::fs::write(
            &path,
            r#"
backend: virsh
machine:
  machine_name: crc
  store_path: /home/user/.crc
  memory_mib: 10752
  cache_mode: unsafe
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Virsh);
        assert_eq!(config.machine.memory_mib, 10752);
        assert_eq!(config.machine.cache_mode, DiskCacheMode::Unsafe);
        assert_eq!(config.machine.store_path, PathBuf::from("/home/user/.crc"));
        // Unset fields keep their defaults
        assert_eq!(config.machine.cpus, 4);
        assert_eq!(config.machine.network, "crc");
        assert_eq!(config.machine.ssh_user, "core");
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load("/nonexistent/driver.yaml").unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.yaml");
        std::fs::write(&path, "machine: [not, a, map]").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::default()
            .with_cli_overrides(&args(&[
                "--memory",
                "16384",
                "--cpus",
                "8",
                "--storage-pool",
                "images",
                "--io-mode",
                "native",
                "--vsock",
                "--connect",
                "qemu:///session",
            ]))
            .unwrap();

        assert_eq!(config.machine.memory_mib, 16384);
        assert_eq!(config.machine.cpus, 8);
        assert_eq!(config.machine.storage_pool, "images");
        assert_eq!(config.machine.io_mode, DiskIoMode::Native);
        assert!(config.machine.vsock);
        assert_eq!(config.machine.connection_uri, "qemu:///session");
    }

    #[test]
    fn test_invalid_cache_mode() {
        let result = Config::default().with_cli_overrides(&args(&["--cache-mode", "fast"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_dev_forces_mock() {
        let config = Config::default_with_cli(&args(&["--backend", "virsh", "--dev"])).unwrap();
        assert_eq!(config.backend, BackendKind::Mock);
    }
}
