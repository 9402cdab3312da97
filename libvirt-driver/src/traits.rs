//! Hypervisor backend abstraction.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Operations the driver needs from a hypervisor.
///
/// Implementations own their connection: it is opened on first use and kept
/// for the lifetime of the backend. A dropped connection surfaces as an
/// operation error; there is no reconnection.
///
/// Lookups return `Ok(None)` when the object does not exist and `Err` only
/// when the hypervisor could not be asked.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Optional capabilities of this backend.
    fn features(&self) -> BackendFeatures;

    // =========================================================================
    // Connection
    // =========================================================================

    /// Library version encoded as `major * 1_000_000 + minor * 1_000 + micro`.
    async fn lib_version(&self) -> Result<u64>;

    /// Host capabilities document.
    async fn capabilities_xml(&self) -> Result<String>;

    // =========================================================================
    // Networks
    // =========================================================================

    async fn lookup_network(&self, name: &str) -> Result<Option<NetworkHandle>>;

    async fn network_xml(&self, network: &NetworkHandle) -> Result<String>;

    async fn network_is_active(&self, network: &NetworkHandle) -> Result<bool>;

    /// Activate (start) a defined network.
    async fn network_create(&self, network: &NetworkHandle) -> Result<()>;

    /// Define a persistent network from its descriptor.
    async fn network_define(&self, xml: &str) -> Result<NetworkHandle>;

    /// Host bridge device backing the network.
    async fn network_bridge_name(&self, network: &NetworkHandle) -> Result<String>;

    // =========================================================================
    // Storage pools and volumes
    // =========================================================================

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolHandle>>;

    /// Define a persistent pool from its descriptor.
    async fn pool_define(&self, xml: &str) -> Result<PoolHandle>;

    /// Activate (start) a defined pool.
    async fn pool_create(&self, pool: &PoolHandle) -> Result<()>;

    /// Re-scan the pool's backing directory for volumes.
    async fn pool_refresh(&self, pool: &PoolHandle) -> Result<()>;

    async fn pool_info(&self, pool: &PoolHandle) -> Result<PoolInfo>;

    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<Option<VolumeHandle>>;

    async fn volume_info(&self, volume: &VolumeHandle) -> Result<VolumeInfo>;

    async fn volume_resize(&self, volume: &VolumeHandle, capacity_bytes: u64) -> Result<()>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// Define a persistent domain from its descriptor.
    async fn domain_define(&self, xml: &str) -> Result<DomainHandle>;

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainHandle>>;

    /// Boot a defined domain.
    async fn domain_create(&self, domain: &DomainHandle) -> Result<()>;

    /// Ask the guest to power off (ACPI).
    async fn domain_shutdown(&self, domain: &DomainHandle) -> Result<()>;

    /// Power the domain off immediately.
    async fn domain_destroy(&self, domain: &DomainHandle) -> Result<()>;

    /// Remove the persistent definition.
    async fn domain_undefine(&self, domain: &DomainHandle) -> Result<()>;

    async fn domain_state(&self, domain: &DomainHandle) -> Result<DomainState>;

    async fn domain_xml(&self, domain: &DomainHandle) -> Result<String>;

    /// Live interface addresses from the DHCP lease source.
    ///
    /// Only called when [`BackendFeatures::interface_addresses`] is set.
    async fn domain_interface_addresses(&self, domain: &DomainHandle) -> Result<Vec<GuestInterface>>;

    async fn domain_set_memory(&self, domain: &DomainHandle, kib: u64, scope: SettingScope) -> Result<()>;

    /// Set the vCPU count. `Maximum` also updates the persistent config.
    async fn domain_set_vcpus(&self, domain: &DomainHandle, count: u32, scope: SettingScope) -> Result<()>;
}
