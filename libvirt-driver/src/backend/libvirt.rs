//! Native libvirt backend.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{DriverError, Result};
use crate::traits::Hypervisor;
use crate::types::*;

/// Libvirt/QEMU hypervisor backend.
///
/// The connection is opened on first use and kept for the lifetime of the
/// backend. A dropped connection is not re-established.
pub struct LibvirtBackend {
    uri: String,
    connection: OnceCell<Connect>,
}

impl LibvirtBackend {
    /// Create a backend for the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection: OnceCell::new(),
        }
    }

    fn conn(&self) -> Result<&Connect> {
        self.connection.get_or_try_init(|| {
            info!(uri = %self.uri, "Connecting to libvirt");
            Connect::open(Some(&self.uri)).map_err(|e| {
                warn!(error = %e, "Failed to connect to libvirt");
                DriverError::ConnectionFailed(e.to_string())
            })
        })
    }

    fn network(&self, handle: &NetworkHandle) -> Result<Network> {
        Network::lookup_by_name(self.conn()?, handle.name())
            .map_err(|e| DriverError::backend("lookup network", e))
    }

    fn pool(&self, handle: &PoolHandle) -> Result<StoragePool> {
        StoragePool::lookup_by_name(self.conn()?, handle.name())
            .map_err(|e| DriverError::backend("lookup pool", e))
    }

    fn volume(&self, handle: &VolumeHandle) -> Result<StorageVol> {
        let pool = self.pool(&PoolHandle::new(handle.pool()))?;
        StorageVol::lookup_by_name(&pool, handle.name())
            .map_err(|e| DriverError::backend("lookup volume", e))
    }

    fn domain(&self, handle: &DomainHandle) -> Result<Domain> {
        Domain::lookup_by_name(self.conn()?, handle.name())
            .map_err(|e| DriverError::backend("lookup domain", e))
    }

    /// Convert libvirt domain state to DomainState.
    fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
        match state {
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => DomainState::PmSuspended,
            _ => DomainState::NoState,
        }
    }
}

/// `Ok(None)` for libvirt's "no such object" errors.
fn not_found<T>(result: std::result::Result<T, virt::error::Error>, operation: &'static str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_no_such_object(&e) => Ok(None),
        Err(e) => Err(DriverError::backend(operation, e)),
    }
}

fn is_no_such_object(e: &virt::error::Error) -> bool {
    matches!(
        e.code(),
        virt::error::ErrorNumber::NoDomain
            | virt::error::ErrorNumber::NoNetwork
            | virt::error::ErrorNumber::NoStoragePool
            | virt::error::ErrorNumber::NoStorageVol
    )
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            interface_addresses: true,
            define_networks: false,
        }
    }

    #[instrument(skip(self))]
    async fn lib_version(&self) -> Result<u64> {
        let version = self
            .conn()?
            .get_lib_version()
            .map_err(|e| DriverError::backend("get lib version", e))?;
        Ok(version as u64)
    }

    async fn capabilities_xml(&self) -> Result<String> {
        self.conn()?
            .get_capabilities()
            .map_err(|e| DriverError::backend("get capabilities", e))
    }

    // =========================================================================
    // Networks
    // =========================================================================

    async fn lookup_network(&self, name: &str) -> Result<Option<NetworkHandle>> {
        let found = not_found(Network::lookup_by_name(self.conn()?, name), "lookup network")?;
        Ok(found.map(|_| NetworkHandle::new(name)))
    }

    async fn network_xml(&self, network: &NetworkHandle) -> Result<String> {
        self.network(network)?
            .get_xml_desc(0)
            .map_err(|e| DriverError::backend("get network XML", e))
    }

    async fn network_is_active(&self, network: &NetworkHandle) -> Result<bool> {
        self.network(network)?
            .is_active()
            .map_err(|e| DriverError::backend("network is active", e))
    }

    #[instrument(skip(self), fields(network = %network.name()))]
    async fn network_create(&self, network: &NetworkHandle) -> Result<()> {
        self.network(network)?
            .create()
            .map(|_| ())
            .map_err(|e| DriverError::backend("start network", e))
    }

    async fn network_define(&self, xml: &str) -> Result<NetworkHandle> {
        let network = Network::define_xml(self.conn()?, xml)
            .map_err(|e| DriverError::backend("define network", e))?;
        let name = network
            .get_name()
            .map_err(|e| DriverError::backend("get network name", e))?;
        Ok(NetworkHandle::new(name))
    }

    async fn network_bridge_name(&self, network: &NetworkHandle) -> Result<String> {
        self.network(network)?
            .get_bridge_name()
            .map_err(|e| DriverError::backend("get bridge name", e))
    }

    // =========================================================================
    // Storage pools and volumes
    // =========================================================================

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolHandle>> {
        let found = not_found(StoragePool::lookup_by_name(self.conn()?, name), "lookup pool")?;
        Ok(found.map(|_| PoolHandle::new(name)))
    }

    async fn pool_define(&self, xml: &str) -> Result<PoolHandle> {
        let pool = StoragePool::define_xml(self.conn()?, xml, 0)
            .map_err(|e| DriverError::backend("define pool", e))?;
        let name = pool
            .get_name()
            .map_err(|e| DriverError::backend("get pool name", e))?;
        Ok(PoolHandle::new(name))
    }

    #[instrument(skip(self), fields(pool = %pool.name()))]
    async fn pool_create(&self, pool: &PoolHandle) -> Result<()> {
        self.pool(pool)?
            .create(0)
            .map(|_| ())
            .map_err(|e| DriverError::backend("start pool", e))
    }

    async fn pool_refresh(&self, pool: &PoolHandle) -> Result<()> {
        self.pool(pool)?
            .refresh(0)
            .map(|_| ())
            .map_err(|e| DriverError::backend("refresh pool", e))
    }

    async fn pool_info(&self, pool: &PoolHandle) -> Result<PoolInfo> {
        let info = self
            .pool(pool)?
            .get_info()
            .map_err(|e| DriverError::backend("get pool info", e))?;
        Ok(PoolInfo {
            active: info.state == sys::VIR_STORAGE_POOL_RUNNING,
            capacity_bytes: info.capacity,
            allocation_bytes: info.allocation,
            available_bytes: info.available,
        })
    }

    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<Option<VolumeHandle>> {
        let p = self.pool(pool)?;
        let found = not_found(StorageVol::lookup_by_name(&p, name), "lookup volume")?;
        Ok(found.map(|_| VolumeHandle::new(pool.name(), name)))
    }

    async fn volume_info(&self, volume: &VolumeHandle) -> Result<VolumeInfo> {
        let info = self
            .volume(volume)?
            .get_info()
            .map_err(|e| DriverError::backend("get volume info", e))?;
        Ok(VolumeInfo {
            capacity_bytes: info.capacity,
            allocation_bytes: info.allocation,
        })
    }

    #[instrument(skip(self), fields(volume = %volume.name()))]
    async fn volume_resize(&self, volume: &VolumeHandle, capacity_bytes: u64) -> Result<()> {
        self.volume(volume)?
            .resize(capacity_bytes, 0)
            .map(|_| ())
            .map_err(|e| DriverError::backend("resize volume", e))
    }

    // =========================================================================
    // Domains
    // =========================================================================

    async fn domain_define(&self, xml: &str) -> Result<DomainHandle> {
        let domain = Domain::define_xml(self.conn()?, xml)
            .map_err(|e| DriverError::backend("define domain", e))?;
        let name = domain
            .get_name()
            .map_err(|e| DriverError::backend("get domain name", e))?;
        debug!(domain = %name, "Domain defined");
        Ok(DomainHandle::new(name))
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainHandle>> {
        let found = not_found(Domain::lookup_by_name(self.conn()?, name), "lookup domain")?;
        Ok(found.map(|_| DomainHandle::new(name)))
    }

    #[instrument(skip(self), fields(domain = %domain.name()))]
    async fn domain_create(&self, domain: &DomainHandle) -> Result<()> {
        self.domain(domain)?
            .create()
            .map(|_| ())
            .map_err(|e| DriverError::backend("start domain", e))
    }

    #[instrument(skip(self), fields(domain = %domain.name()))]
    async fn domain_shutdown(&self, domain: &DomainHandle) -> Result<()> {
        self.domain(domain)?
            .shutdown()
            .map(|_| ())
            .map_err(|e| DriverError::backend("shutdown domain", e))
    }

    #[instrument(skip(self), fields(domain = %domain.name()))]
    async fn domain_destroy(&self, domain: &DomainHandle) -> Result<()> {
        self.domain(domain)?
            .destroy()
            .map(|_| ())
            .map_err(|e| DriverError::backend("destroy domain", e))
    }

    #[instrument(skip(self), fields(domain = %domain.name()))]
    async fn domain_undefine(&self, domain: &DomainHandle) -> Result<()> {
        self.domain(domain)?
            .undefine()
            .map(|_| ())
            .map_err(|e| DriverError::backend("undefine domain", e))
    }

    async fn domain_state(&self, domain: &DomainHandle) -> Result<DomainState> {
        let (state, _reason) = self
            .domain(domain)?
            .get_state()
            .map_err(|e| DriverError::backend("get domain state", e))?;
        Ok(Self::state_from_libvirt(state))
    }

    async fn domain_xml(&self, domain: &DomainHandle) -> Result<String> {
        self.domain(domain)?
            .get_xml_desc(0)
            .map_err(|e| DriverError::backend("get domain XML", e))
    }

    async fn domain_interface_addresses(&self, domain: &DomainHandle) -> Result<Vec<GuestInterface>> {
        let interfaces = self
            .domain(domain)?
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
            .map_err(|e| DriverError::backend("list interface addresses", e))?;

        Ok(interfaces
            .into_iter()
            .map(|iface| GuestInterface {
                name: iface.name,
                hwaddr: iface.hwaddr,
                addresses: iface
                    .addrs
                    .into_iter()
                    .map(|a| InterfaceAddress {
                        family: if a.typed == sys::VIR_IP_ADDR_TYPE_IPV4 as i64 {
                            IpFamily::V4
                        } else {
                            IpFamily::V6
                        },
                        address: a.addr,
                        prefix: a.prefix,
                    })
                    .collect(),
            })
            .collect())
    }

    #[instrument(skip(self), fields(domain = %domain.name()))]
    async fn domain_set_memory(&self, domain: &DomainHandle, kib: u64, scope: SettingScope) -> Result<()> {
        let flags = match scope {
            SettingScope::Maximum => sys::VIR_DOMAIN_MEM_MAXIMUM,
            SettingScope::Config => sys::VIR_DOMAIN_MEM_CONFIG,
        };
        self.domain(domain)?
            .set_memory_flags(kib, flags)
            .map(|_| ())
            .map_err(|e| DriverError::backend("set memory", e))
    }

    #[instrument(skip(self), fields(domain = %domain.name()))]
    async fn domain_set_vcpus(&self, domain: &DomainHandle, count: u32, scope: SettingScope) -> Result<()> {
        let flags = match scope {
            SettingScope::Maximum => sys::VIR_DOMAIN_VCPU_CONFIG | sys::VIR_DOMAIN_VCPU_MAXIMUM,
            SettingScope::Config => sys::VIR_DOMAIN_VCPU_CONFIG,
        };
        self.domain(domain)?
            .set_vcpus_flags(count, flags)
            .map(|_| ())
            .map_err(|e| DriverError::backend("set vcpus", e))
    }
}
