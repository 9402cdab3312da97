//! Type definitions shared by the driver and its backends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

// =============================================================================
// DISK SETTINGS
// =============================================================================

/// Disk caching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskCacheMode {
    #[default]
    Default,
    None,
    Writethrough,
    Writeback,
    Directsync,
    Unsafe,
}

impl DiskCacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskCacheMode::Default => "default",
            DiskCacheMode::None => "none",
            DiskCacheMode::Writethrough => "writethrough",
            DiskCacheMode::Writeback => "writeback",
            DiskCacheMode::Directsync => "directsync",
            DiskCacheMode::Unsafe => "unsafe",
        }
    }
}

impl FromStr for DiskCacheMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(DiskCacheMode::Default),
            "none" => Ok(DiskCacheMode::None),
            "writethrough" => Ok(DiskCacheMode::Writethrough),
            "writeback" => Ok(DiskCacheMode::Writeback),
            "directsync" => Ok(DiskCacheMode::Directsync),
            "unsafe" => Ok(DiskCacheMode::Unsafe),
            other => Err(DriverError::InvalidConfig(format!(
                "disk cache mode must be one of default, none, writethrough, writeback, directsync or unsafe, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for DiskCacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disk IO mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskIoMode {
    #[default]
    Threads,
    Native,
}

impl DiskIoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskIoMode::Threads => "threads",
            DiskIoMode::Native => "native",
        }
    }
}

impl FromStr for DiskIoMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threads" => Ok(DiskIoMode::Threads),
            "native" => Ok(DiskIoMode::Native),
            other => Err(DriverError::InvalidConfig(format!(
                "disk IO mode must be threads or native, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for DiskIoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Raw domain state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

/// Machine state exposed to the orchestrating tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Never defined, or the hypervisor has no state for it
    None,
    /// Defined but not running
    Stopped,
    Running,
    Paused,
    /// Blocked or crashed
    Error,
    /// Suspended to disk
    Saved,
}

impl From<DomainState> for MachineState {
    fn from(state: DomainState) -> Self {
        match state {
            DomainState::NoState => MachineState::None,
            DomainState::Running => MachineState::Running,
            // Blocked on a resource is not really an error, but it is the
            // closest thing the orchestrator understands.
            DomainState::Blocked => MachineState::Error,
            DomainState::Paused => MachineState::Paused,
            DomainState::Shutdown => MachineState::Stopped,
            DomainState::Shutoff => MachineState::Stopped,
            DomainState::Crashed => MachineState::Error,
            DomainState::PmSuspended => MachineState::Saved,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::None => "",
            MachineState::Stopped => "Stopped",
            MachineState::Running => "Running",
            MachineState::Paused => "Paused",
            MachineState::Error => "Error",
            MachineState::Saved => "Saved",
        };
        f.write_str(s)
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Reference to a defined domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    name: String,
}

impl DomainHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Reference to a virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    name: String,
}

impl NetworkHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Reference to a storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHandle {
    name: String,
}

impl PoolHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Reference to a volume inside a storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pool: String,
    name: String,
}

impl VolumeHandle {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// INFO STRUCTS
// =============================================================================

/// Storage pool status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolInfo {
    pub active: bool,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
    pub available_bytes: u64,
}

/// Storage volume status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Logical size seen by the guest
    pub capacity_bytes: u64,
    /// Bytes actually allocated on the host
    pub allocation_bytes: u64,
}

/// Address family of an interface address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// One address assigned to a guest interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub family: IpFamily,
    pub address: String,
    pub prefix: u32,
}

/// A guest interface as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInterface {
    pub name: String,
    /// Hardware (MAC) address
    pub hwaddr: String,
    pub addresses: Vec<InterfaceAddress>,
}

/// Which definition a memory or vCPU change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingScope {
    /// Upper bound in the persistent definition
    Maximum,
    /// Current value in the persistent definition
    Config,
}

/// Optional capabilities of a hypervisor backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendFeatures {
    /// Can list live guest interface addresses
    pub interface_addresses: bool,
    /// Allowed to define new virtual networks
    pub define_networks: bool,
}
