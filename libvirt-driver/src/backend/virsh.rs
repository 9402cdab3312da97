//! Backend that shells out to `virsh`.
//!
//! Every operation is one `virsh --connect <uri> ...` invocation bounded by a
//! timeout. Objects are addressed by name, so handles carry nothing else.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{DriverError, Result};
use crate::exec::run_command;
use crate::traits::Hypervisor;
use crate::types::*;
use crate::xml::descriptor_name;

/// Default per-command timeout.
pub const DEFAULT_VIRSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Hypervisor backend driving the `virsh` command line tool.
///
/// It cannot list guest interface addresses: the driver falls back to the
/// dnsmasq lease file of the network bridge.
pub struct VirshBackend {
    program: String,
    uri: String,
    timeout: Duration,
}

impl VirshBackend {
    /// Create a backend talking to the hypervisor at `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            program: "virsh".to_string(),
            uri: uri.into(),
            timeout: DEFAULT_VIRSH_TIMEOUT,
        }
    }

    /// Use another `virsh` binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["--connect", self.uri.as_str()];
        full.extend_from_slice(args);

        match run_command(&self.program, &full, self.timeout).await {
            Ok(output) => Ok(output.stdout),
            Err(DriverError::CommandFailed { stderr, .. }) if is_connection_error(&stderr) => {
                Err(DriverError::ConnectionFailed(stderr.trim().to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Run a query whose failure with a "not found" diagnostic means the
    /// object does not exist.
    async fn exists(&self, args: &[&str]) -> Result<bool> {
        match self.virsh(args).await {
            Ok(_) => Ok(true),
            Err(DriverError::CommandFailed { stderr, .. }) if is_not_found(&stderr) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Hand a descriptor to a `*-define` command through a temporary file.
    async fn define(&self, command: &str, xml: &str) -> Result<String> {
        let name = descriptor_name(xml)?;

        let mut file = tempfile::Builder::new()
            .prefix("libvirt-driver-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| DriverError::io("failed to create descriptor file", e))?;
        file.write_all(xml.as_bytes())
            .map_err(|e| DriverError::io("failed to write descriptor file", e))?;

        let path = file.path().to_string_lossy().into_owned();
        self.virsh(&[command, &path]).await?;
        Ok(name)
    }
}

#[async_trait]
impl Hypervisor for VirshBackend {
    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            interface_addresses: false,
            define_networks: false,
        }
    }

    async fn lib_version(&self) -> Result<u64> {
        let out = self.virsh(&["version"]).await?;
        parse_lib_version(&out)
    }

    async fn capabilities_xml(&self) -> Result<String> {
        self.virsh(&["capabilities"]).await
    }

    // =========================================================================
    // Networks
    // =========================================================================

    async fn lookup_network(&self, name: &str) -> Result<Option<NetworkHandle>> {
        let found = self.exists(&["net-info", name]).await?;
        Ok(found.then(|| NetworkHandle::new(name)))
    }

    async fn network_xml(&self, network: &NetworkHandle) -> Result<String> {
        self.virsh(&["net-dumpxml", network.name()]).await
    }

    async fn network_is_active(&self, network: &NetworkHandle) -> Result<bool> {
        let out = self.virsh(&["net-info", network.name()]).await?;
        Ok(info_field(&out, "Active") == Some("yes"))
    }

    async fn network_create(&self, network: &NetworkHandle) -> Result<()> {
        self.virsh(&["net-start", network.name()]).await.map(|_| ())
    }

    async fn network_define(&self, xml: &str) -> Result<NetworkHandle> {
        self.define("net-define", xml).await.map(NetworkHandle::new)
    }

    async fn network_bridge_name(&self, network: &NetworkHandle) -> Result<String> {
        let out = self.virsh(&["net-info", network.name()]).await?;
        info_field(&out, "Bridge")
            .map(str::to_string)
            .ok_or_else(|| DriverError::backend("network bridge name", "no bridge in net-info output"))
    }

    // =========================================================================
    // Storage pools and volumes
    // =========================================================================

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolHandle>> {
        let found = self.exists(&["pool-info", name]).await?;
        Ok(found.then(|| PoolHandle::new(name)))
    }

    async fn pool_define(&self, xml: &str) -> Result<PoolHandle> {
        self.define("pool-define", xml).await.map(PoolHandle::new)
    }

    async fn pool_create(&self, pool: &PoolHandle) -> Result<()> {
        self.virsh(&["pool-start", pool.name()]).await.map(|_| ())
    }

    async fn pool_refresh(&self, pool: &PoolHandle) -> Result<()> {
        self.virsh(&["pool-refresh", pool.name()]).await.map(|_| ())
    }

    async fn pool_info(&self, pool: &PoolHandle) -> Result<PoolInfo> {
        let out = self.virsh(&["pool-info", "--bytes", pool.name()]).await?;
        parse_pool_info(&out)
    }

    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<Option<VolumeHandle>> {
        let found = self
            .exists(&["vol-info", "--pool", pool.name(), name])
            .await?;
        Ok(found.then(|| VolumeHandle::new(pool.name(), name)))
    }

    async fn volume_info(&self, volume: &VolumeHandle) -> Result<VolumeInfo> {
        let out = self
            .virsh(&["vol-info", "--bytes", "--pool", volume.pool(), volume.name()])
            .await?;
        parse_volume_info(&out)
    }

    #[instrument(skip(self), fields(volume = %volume.name()))]
    async fn volume_resize(&self, volume: &VolumeHandle, capacity_bytes: u64) -> Result<()> {
        let capacity = capacity_bytes.to_string();
        self.virsh(&["vol-resize", "--pool", volume.pool(), volume.name(), &capacity])
            .await
            .map(|_| ())
    }

    // =========================================================================
    // Domains
    // =========================================================================

    async fn domain_define(&self, xml: &str) -> Result<DomainHandle> {
        self.define("define", xml).await.map(DomainHandle::new)
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainHandle>> {
        let found = self.exists(&["domuuid", name]).await?;
        Ok(found.then(|| DomainHandle::new(name)))
    }

    async fn domain_create(&self, domain: &DomainHandle) -> Result<()> {
        self.virsh(&["start", domain.name()]).await.map(|_| ())
    }

    async fn domain_shutdown(&self, domain: &DomainHandle) -> Result<()> {
        self.virsh(&["shutdown", domain.name()]).await.map(|_| ())
    }

    async fn domain_destroy(&self, domain: &DomainHandle) -> Result<()> {
        self.virsh(&["destroy", domain.name()]).await.map(|_| ())
    }

    async fn domain_undefine(&self, domain: &DomainHandle) -> Result<()> {
        self.virsh(&["undefine", domain.name()]).await.map(|_| ())
    }

    async fn domain_state(&self, domain: &DomainHandle) -> Result<DomainState> {
        let out = self.virsh(&["domstate", domain.name()]).await?;
        parse_domstate(&out)
    }

    async fn domain_xml(&self, domain: &DomainHandle) -> Result<String> {
        self.virsh(&["dumpxml", domain.name()]).await
    }

    async fn domain_interface_addresses(&self, _domain: &DomainHandle) -> Result<Vec<GuestInterface>> {
        Err(DriverError::backend(
            "list interface addresses",
            "not supported by the virsh backend",
        ))
    }

    async fn domain_set_memory(&self, domain: &DomainHandle, kib: u64, scope: SettingScope) -> Result<()> {
        let size = format!("{}KiB", kib);
        let command = match scope {
            SettingScope::Maximum => "setmaxmem",
            SettingScope::Config => "setmem",
        };
        debug!(command, size = %size, "Updating memory");
        self.virsh(&[command, domain.name(), &size, "--config"])
            .await
            .map(|_| ())
    }

    async fn domain_set_vcpus(&self, domain: &DomainHandle, count: u32, scope: SettingScope) -> Result<()> {
        let count = count.to_string();
        let mut args = vec!["setvcpus", domain.name(), count.as_str(), "--config"];
        if scope == SettingScope::Maximum {
            args.push("--maximum");
        }
        self.virsh(&args).await.map(|_| ())
    }
}

// =============================================================================
// OUTPUT PARSING
// =============================================================================

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("not found") || stderr.contains("no domain with matching")
}

fn is_connection_error(stderr: &str) -> bool {
    stderr.contains("failed to connect to the hypervisor")
}

/// Value of a `Key:   value` line of `*-info` output.
fn info_field<'a>(out: &'a str, key: &str) -> Option<&'a str> {
    out.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn bytes_field(out: &str, key: &str) -> Result<u64> {
    let value = info_field(out, key)
        .ok_or_else(|| DriverError::backend("parse virsh output", format!("missing {}", key)))?;
    let number = value.split_whitespace().next().unwrap_or_default();
    number
        .parse()
        .map_err(|_| DriverError::backend("parse virsh output", format!("bad {} value '{}'", key, value)))
}

fn parse_domstate(out: &str) -> Result<DomainState> {
    let state = out.lines().next().unwrap_or_default().trim();
    let state = match state {
        "no state" => DomainState::NoState,
        "running" => DomainState::Running,
        "idle" | "blocked" => DomainState::Blocked,
        "paused" => DomainState::Paused,
        "in shutdown" => DomainState::Shutdown,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        "pmsuspended" => DomainState::PmSuspended,
        other => {
            return Err(DriverError::backend(
                "domain state",
                format!("unknown domain state '{}'", other),
            ))
        }
    };
    Ok(state)
}

fn parse_pool_info(out: &str) -> Result<PoolInfo> {
    Ok(PoolInfo {
        active: info_field(out, "State") == Some("running"),
        capacity_bytes: bytes_field(out, "Capacity").unwrap_or_default(),
        allocation_bytes: bytes_field(out, "Allocation").unwrap_or_default(),
        available_bytes: bytes_field(out, "Available").unwrap_or_default(),
    })
}

fn parse_volume_info(out: &str) -> Result<VolumeInfo> {
    Ok(VolumeInfo {
        capacity_bytes: bytes_field(out, "Capacity")?,
        allocation_bytes: bytes_field(out, "Allocation")?,
    })
}

/// `Using library: libvirt 9.0.0` as `9_000_000`.
fn parse_lib_version(out: &str) -> Result<u64> {
    let version = info_field(out, "Using library")
        .and_then(|v| v.split_whitespace().last())
        .ok_or_else(|| DriverError::backend("lib version", "no library version in virsh output"))?;

    let mut parts = version.split('.').map(|p| p.parse::<u64>());
    let mut next = || parts.next().unwrap_or(Ok(0));
    match (next(), next(), next()) {
        (Ok(major), Ok(minor), Ok(micro)) => Ok(major * 1_000_000 + minor * 1_000 + micro),
        _ => Err(DriverError::backend(
            "lib version",
            format!("bad version '{}'", version),
        )),
    }
}
