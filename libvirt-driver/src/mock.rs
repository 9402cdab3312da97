//! Mock hypervisor backend for testing and development.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::error::{DriverError, Result};
use crate::traits::Hypervisor;
use crate::types::*;
use crate::xml::NetworkDoc;

/// A network with a single DHCP-enabled IPv4 block, the shape the driver expects.
pub const DHCP_NETWORK_XML: &str = "<network>
  <name>crc</name>
  <forward mode='nat'/>
  <bridge name='crc' stp='on' delay='0'/>
  <ip address='192.168.130.1' prefix='24'>
    <dhcp>
      <range start='192.168.130.11' end='192.168.130.11'/>
    </dhcp>
  </ip>
</network>";

/// Host capabilities advertising q35 for the host architecture.
pub fn q35_capabilities_xml() -> String {
    let arch = std::env::consts::ARCH;
    format!(
        "<capabilities>
  <host><cpu><arch>{arch}</arch></cpu></host>
  <guest>
    <os_type>hvm</os_type>
    <arch name='{arch}'>
      <machine maxCpus='255'>pc-i440fx-8.2</machine>
      <machine canonical='pc-q35-8.2' maxCpus='288'>q35</machine>
    </arch>
  </guest>
</capabilities>"
    )
}

/// Operation counters, for asserting what the driver asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub network_lookups: u32,
    pub network_defines: u32,
    pub network_creates: u32,
    pub pool_defines: u32,
    pub pool_creates: u32,
    pub pool_refreshes: u32,
    pub volume_resizes: u32,
    pub domain_defines: u32,
    pub domain_creates: u32,
    pub domain_shutdowns: u32,
    pub domain_destroys: u32,
    pub domain_undefines: u32,
    pub state_queries: u32,
    pub domain_xml_reads: u32,
    pub interface_queries: u32,
    pub memory_updates: u32,
    pub vcpu_updates: u32,
}

struct MockNetwork {
    xml: String,
    active: bool,
    bridge: String,
}

struct MockPool {
    target: String,
    active: bool,
    volumes: HashMap<String, u64>,
}

struct MockDomain {
    xml: String,
    state: DomainState,
    memory_kib: u64,
    vcpus: u32,
    /// States reported ahead of the real one, front first
    scripted: VecDeque<DomainState>,
    /// Remaining state queries until a requested shutdown completes
    pending_shutdown: Option<u32>,
    interfaces: Vec<GuestInterface>,
}

#[derive(Default)]
struct MockState {
    networks: HashMap<String, MockNetwork>,
    pools: HashMap<String, MockPool>,
    domains: HashMap<String, MockDomain>,
    failures: HashSet<String>,
    /// `None` means the guest ignores ACPI shutdown requests
    shutdown_after: Option<u32>,
    calls: MockCalls,
}

/// Mock hypervisor backend for testing.
///
/// This backend simulates networks, pools, volumes and domains in memory
/// without requiring an actual hypervisor. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed
///
/// Any operation can be made to fail with [`MockBackend::fail_on`], using the
/// trait method name.
pub struct MockBackend {
    state: RwLock<MockState>,
    features: BackendFeatures,
    capabilities: String,
    lib_version: u64,
}

impl MockBackend {
    /// Create a new mock backend.
    ///
    /// Guests shut down on the first state query after a shutdown request.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            state: RwLock::new(MockState {
                shutdown_after: Some(1),
                ..Default::default()
            }),
            features: BackendFeatures {
                interface_addresses: true,
                define_networks: false,
            },
            capabilities: q35_capabilities_xml(),
            lib_version: 9_000_000,
        }
    }

    pub fn with_features(mut self, features: BackendFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_capabilities(mut self, xml: impl Into<String>) -> Self {
        self.capabilities = xml.into();
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, MockState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MockState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Scenario setup
    // =========================================================================

    /// Make every call of the named operation fail.
    pub fn fail_on(&self, operation: &str) {
        self.write().failures.insert(operation.to_string());
    }

    /// Undo [`MockBackend::fail_on`].
    pub fn clear_failure(&self, operation: &str) {
        self.write().failures.remove(operation);
    }

    /// Number of state queries after a shutdown request until the guest
    /// reports `Shutoff`. `None` makes the guest ignore shutdown requests.
    pub fn set_shutdown_after(&self, queries: Option<u32>) {
        self.write().shutdown_after = queries;
    }

    pub fn add_network(&self, name: &str, xml: &str, active: bool, bridge: &str) {
        self.write().networks.insert(
            name.to_string(),
            MockNetwork {
                xml: xml.to_string(),
                active,
                bridge: bridge.to_string(),
            },
        );
    }

    pub fn add_pool(&self, name: &str, target: &Path, active: bool) {
        self.write().pools.insert(
            name.to_string(),
            MockPool {
                target: target.to_string_lossy().into_owned(),
                active,
                volumes: HashMap::new(),
            },
        );
    }

    /// Add a volume to an existing pool.
    pub fn add_volume(&self, pool: &str, name: &str, capacity_bytes: u64) {
        if let Some(p) = self.write().pools.get_mut(pool) {
            p.volumes.insert(name.to_string(), capacity_bytes);
        }
    }

    /// Add a defined domain in the given state.
    pub fn add_domain(&self, name: &str, xml: &str, state: DomainState) {
        self.write().domains.insert(name.to_string(), new_domain(xml, state));
    }

    /// Queue states to report before the real one.
    pub fn script_states(&self, domain: &str, states: impl IntoIterator<Item = DomainState>) {
        if let Some(d) = self.write().domains.get_mut(domain) {
            d.scripted.extend(states);
        }
    }

    pub fn set_interfaces(&self, domain: &str, interfaces: Vec<GuestInterface>) {
        if let Some(d) = self.write().domains.get_mut(domain) {
            d.interfaces = interfaces;
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn calls(&self) -> MockCalls {
        self.read().calls.clone()
    }

    pub fn pool_is_active(&self, name: &str) -> bool {
        self.read().pools.get(name).map(|p| p.active).unwrap_or(false)
    }

    pub fn pool_target(&self, name: &str) -> Option<String> {
        self.read().pools.get(name).map(|p| p.target.clone())
    }

    pub fn network_is_active_now(&self, name: &str) -> bool {
        self.read().networks.get(name).map(|n| n.active).unwrap_or(false)
    }

    pub fn domain_exists(&self, name: &str) -> bool {
        self.read().domains.contains_key(name)
    }

    /// Current state, bypassing scripted states and counters.
    pub fn current_state(&self, name: &str) -> Option<DomainState> {
        self.read().domains.get(name).map(|d| d.state)
    }

    pub fn domain_definition(&self, name: &str) -> Option<String> {
        self.read().domains.get(name).map(|d| d.xml.clone())
    }

    pub fn domain_memory_kib(&self, name: &str) -> Option<u64> {
        self.read().domains.get(name).map(|d| d.memory_kib)
    }

    pub fn domain_vcpus(&self, name: &str) -> Option<u32> {
        self.read().domains.get(name).map(|d| d.vcpus)
    }

    pub fn volume_capacity_of(&self, pool: &str, volume: &str) -> Option<u64> {
        self.read()
            .pools
            .get(pool)
            .and_then(|p| p.volumes.get(volume).copied())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check(state: &MockState, operation: &'static str) -> Result<()> {
    if state.failures.contains(operation) {
        return Err(DriverError::backend(operation, "injected failure"));
    }
    Ok(())
}

fn no_domain(operation: &'static str, name: &str) -> DriverError {
    DriverError::backend(
        operation,
        format!("Domain not found: no domain with matching name '{}'", name),
    )
}

fn new_domain(xml: &str, state: DomainState) -> MockDomain {
    let doc: DefinedDomain = quick_xml::de::from_str(xml).unwrap_or_default();
    MockDomain {
        xml: xml.to_string(),
        state,
        memory_kib: doc.memory.map(|m| m.value * 1024).unwrap_or_default(),
        vcpus: doc.vcpu.map(|v| v.value).unwrap_or_default(),
        scripted: VecDeque::new(),
        pending_shutdown: None,
        interfaces: Vec::new(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct DefinedDomain {
    #[serde(default)]
    name: String,
    #[serde(default)]
    memory: Option<Amount<u64>>,
    #[serde(default)]
    vcpu: Option<Amount<u32>>,
}

#[derive(Debug, Default, Deserialize)]
struct Amount<T> {
    #[serde(rename = "$text")]
    value: T,
}

#[derive(Debug, Default, Deserialize)]
struct DefinedPool {
    #[serde(default)]
    name: String,
    #[serde(default)]
    target: PoolTarget,
}

#[derive(Debug, Default, Deserialize)]
struct PoolTarget {
    #[serde(default)]
    path: String,
}

fn is_active(state: DomainState) -> bool {
    matches!(
        state,
        DomainState::Running | DomainState::Paused | DomainState::Blocked
    )
}

#[async_trait]
impl Hypervisor for MockBackend {
    fn features(&self) -> BackendFeatures {
        self.features
    }

    async fn lib_version(&self) -> Result<u64> {
        check(&self.read(), "lib_version")?;
        Ok(self.lib_version)
    }

    async fn capabilities_xml(&self) -> Result<String> {
        check(&self.read(), "capabilities_xml")?;
        Ok(self.capabilities.clone())
    }

    // =========================================================================
    // Networks
    // =========================================================================

    async fn lookup_network(&self, name: &str) -> Result<Option<NetworkHandle>> {
        let mut state = self.write();
        state.calls.network_lookups += 1;
        check(&state, "lookup_network")?;
        Ok(state.networks.contains_key(name).then(|| NetworkHandle::new(name)))
    }

    async fn network_xml(&self, network: &NetworkHandle) -> Result<String> {
        let state = self.read();
        check(&state, "network_xml")?;
        state
            .networks
            .get(network.name())
            .map(|n| n.xml.clone())
            .ok_or_else(|| DriverError::backend("network_xml", "network not found"))
    }

    async fn network_is_active(&self, network: &NetworkHandle) -> Result<bool> {
        let state = self.read();
        check(&state, "network_is_active")?;
        Ok(state
            .networks
            .get(network.name())
            .map(|n| n.active)
            .unwrap_or(false))
    }

    #[instrument(skip(self), fields(network = %network.name()))]
    async fn network_create(&self, network: &NetworkHandle) -> Result<()> {
        let mut state = self.write();
        state.calls.network_creates += 1;
        check(&state, "network_create")?;
        let net = state
            .networks
            .get_mut(network.name())
            .ok_or_else(|| DriverError::backend("network_create", "network not found"))?;
        net.active = true;
        info!("Mock network started");
        Ok(())
    }

    async fn network_define(&self, xml: &str) -> Result<NetworkHandle> {
        let mut state = self.write();
        state.calls.network_defines += 1;
        check(&state, "network_define")?;

        let doc = NetworkDoc::parse(xml)?;
        let bridge = doc
            .bridge
            .as_ref()
            .map(|b| b.name.clone())
            .unwrap_or_else(|| doc.name.clone());
        state.networks.insert(
            doc.name.clone(),
            MockNetwork {
                xml: xml.to_string(),
                active: false,
                bridge,
            },
        );
        debug!(network = %doc.name, "Mock network defined");
        Ok(NetworkHandle::new(doc.name))
    }

    async fn network_bridge_name(&self, network: &NetworkHandle) -> Result<String> {
        let state = self.read();
        check(&state, "network_bridge_name")?;
        state
            .networks
            .get(network.name())
            .map(|n| n.bridge.clone())
            .ok_or_else(|| DriverError::backend("network_bridge_name", "network not found"))
    }

    // =========================================================================
    // Storage pools and volumes
    // =========================================================================

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolHandle>> {
        let state = self.read();
        check(&state, "lookup_pool")?;
        Ok(state.pools.contains_key(name).then(|| PoolHandle::new(name)))
    }

    async fn pool_define(&self, xml: &str) -> Result<PoolHandle> {
        let mut state = self.write();
        state.calls.pool_defines += 1;
        check(&state, "pool_define")?;

        let doc: DefinedPool = quick_xml::de::from_str(xml)?;
        state.pools.insert(
            doc.name.clone(),
            MockPool {
                target: doc.target.path,
                active: false,
                volumes: HashMap::new(),
            },
        );
        Ok(PoolHandle::new(doc.name))
    }

    async fn pool_create(&self, pool: &PoolHandle) -> Result<()> {
        let mut state = self.write();
        state.calls.pool_creates += 1;
        check(&state, "pool_create")?;
        let p = state
            .pools
            .get_mut(pool.name())
            .ok_or_else(|| DriverError::backend("pool_create", "pool not found"))?;
        p.active = true;
        Ok(())
    }

    /// Picks up every regular file in the target directory as a volume,
    /// sized by its length.
    async fn pool_refresh(&self, pool: &PoolHandle) -> Result<()> {
        let mut state = self.write();
        state.calls.pool_refreshes += 1;
        check(&state, "pool_refresh")?;
        let p = state
            .pools
            .get_mut(pool.name())
            .ok_or_else(|| DriverError::backend("pool_refresh", "pool not found"))?;

        if let Ok(entries) = std::fs::read_dir(&p.target) {
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else { continue };
                if meta.is_file() {
                    p.volumes
                        .entry(entry.file_name().to_string_lossy().into_owned())
                        .or_insert(meta.len());
                }
            }
        }
        Ok(())
    }

    async fn pool_info(&self, pool: &PoolHandle) -> Result<PoolInfo> {
        let state = self.read();
        check(&state, "pool_info")?;
        let p = state
            .pools
            .get(pool.name())
            .ok_or_else(|| DriverError::backend("pool_info", "pool not found"))?;
        let allocation = p.volumes.values().sum();
        Ok(PoolInfo {
            active: p.active,
            capacity_bytes: 0,
            allocation_bytes: allocation,
            available_bytes: 0,
        })
    }

    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<Option<VolumeHandle>> {
        let state = self.read();
        check(&state, "lookup_volume")?;
        Ok(state
            .pools
            .get(pool.name())
            .filter(|p| p.volumes.contains_key(name))
            .map(|_| VolumeHandle::new(pool.name(), name)))
    }

    async fn volume_info(&self, volume: &VolumeHandle) -> Result<VolumeInfo> {
        let state = self.read();
        check(&state, "volume_info")?;
        let capacity = state
            .pools
            .get(volume.pool())
            .and_then(|p| p.volumes.get(volume.name()))
            .copied()
            .ok_or_else(|| DriverError::backend("volume_info", "volume not found"))?;
        Ok(VolumeInfo {
            capacity_bytes: capacity,
            allocation_bytes: capacity,
        })
    }

    async fn volume_resize(&self, volume: &VolumeHandle, capacity_bytes: u64) -> Result<()> {
        let mut state = self.write();
        state.calls.volume_resizes += 1;
        check(&state, "volume_resize")?;
        let capacity = state
            .pools
            .get_mut(volume.pool())
            .and_then(|p| p.volumes.get_mut(volume.name()))
            .ok_or_else(|| DriverError::backend("volume_resize", "volume not found"))?;
        *capacity = capacity_bytes;
        Ok(())
    }

    // =========================================================================
    // Domains
    // =========================================================================

    #[instrument(skip(self, xml))]
    async fn domain_define(&self, xml: &str) -> Result<DomainHandle> {
        let mut state = self.write();
        state.calls.domain_defines += 1;
        check(&state, "domain_define")?;

        let doc: DefinedDomain = quick_xml::de::from_str(xml)?;
        if doc.name.is_empty() {
            return Err(DriverError::backend("domain_define", "missing domain name"));
        }
        state
            .domains
            .insert(doc.name.clone(), new_domain(xml, DomainState::Shutoff));
        info!(domain = %doc.name, "Mock domain defined");
        Ok(DomainHandle::new(doc.name))
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainHandle>> {
        let state = self.read();
        check(&state, "lookup_domain")?;
        Ok(state.domains.contains_key(name).then(|| DomainHandle::new(name)))
    }

    #[instrument(skip(self), fields(domain = %domain.name()))]
    async fn domain_create(&self, domain: &DomainHandle) -> Result<()> {
        let mut state = self.write();
        state.calls.domain_creates += 1;
        check(&state, "domain_create")?;
        let d = state
            .domains
            .get_mut(domain.name())
            .ok_or_else(|| no_domain("domain_create", domain.name()))?;
        if is_active(d.state) {
            return Err(DriverError::backend(
                "domain_create",
                "Requested operation is not valid: domain is already running",
            ));
        }
        d.state = DomainState::Running;
        info!("Mock domain started");
        Ok(())
    }

    async fn domain_shutdown(&self, domain: &DomainHandle) -> Result<()> {
        let mut state = self.write();
        state.calls.domain_shutdowns += 1;
        check(&state, "domain_shutdown")?;
        let shutdown_after = state.shutdown_after;
        let d = state
            .domains
            .get_mut(domain.name())
            .ok_or_else(|| no_domain("domain_shutdown", domain.name()))?;
        if !is_active(d.state) {
            return Err(DriverError::backend(
                "domain_shutdown",
                "Requested operation is not valid: domain is not running",
            ));
        }
        d.pending_shutdown = shutdown_after;
        Ok(())
    }

    async fn domain_destroy(&self, domain: &DomainHandle) -> Result<()> {
        let mut state = self.write();
        state.calls.domain_destroys += 1;
        check(&state, "domain_destroy")?;
        let d = state
            .domains
            .get_mut(domain.name())
            .ok_or_else(|| no_domain("domain_destroy", domain.name()))?;
        if !is_active(d.state) {
            return Err(DriverError::backend(
                "domain_destroy",
                "Requested operation is not valid: domain is not running",
            ));
        }
        d.state = DomainState::Shutoff;
        d.pending_shutdown = None;
        Ok(())
    }

    async fn domain_undefine(&self, domain: &DomainHandle) -> Result<()> {
        let mut state = self.write();
        state.calls.domain_undefines += 1;
        check(&state, "domain_undefine")?;
        state
            .domains
            .remove(domain.name())
            .map(|_| ())
            .ok_or_else(|| no_domain("domain_undefine", domain.name()))
    }

    async fn domain_state(&self, domain: &DomainHandle) -> Result<DomainState> {
        let mut state = self.write();
        state.calls.state_queries += 1;
        check(&state, "domain_state")?;
        let d = state
            .domains
            .get_mut(domain.name())
            .ok_or_else(|| no_domain("domain_state", domain.name()))?;

        if let Some(scripted) = d.scripted.pop_front() {
            return Ok(scripted);
        }

        if let Some(remaining) = d.pending_shutdown {
            if remaining <= 1 {
                d.state = DomainState::Shutoff;
                d.pending_shutdown = None;
            } else {
                d.pending_shutdown = Some(remaining - 1);
            }
        }
        Ok(d.state)
    }

    async fn domain_xml(&self, domain: &DomainHandle) -> Result<String> {
        let mut state = self.write();
        state.calls.domain_xml_reads += 1;
        check(&state, "domain_xml")?;
        state
            .domains
            .get(domain.name())
            .map(|d| d.xml.clone())
            .ok_or_else(|| no_domain("domain_xml", domain.name()))
    }

    async fn domain_interface_addresses(&self, domain: &DomainHandle) -> Result<Vec<GuestInterface>> {
        let mut state = self.write();
        state.calls.interface_queries += 1;
        check(&state, "domain_interface_addresses")?;
        state
            .domains
            .get(domain.name())
            .map(|d| d.interfaces.clone())
            .ok_or_else(|| no_domain("domain_interface_addresses", domain.name()))
    }

    async fn domain_set_memory(&self, domain: &DomainHandle, kib: u64, scope: SettingScope) -> Result<()> {
        let mut state = self.write();
        state.calls.memory_updates += 1;
        check(&state, "domain_set_memory")?;
        let d = state
            .domains
            .get_mut(domain.name())
            .ok_or_else(|| no_domain("domain_set_memory", domain.name()))?;
        debug!(kib, ?scope, "Mock memory update");
        d.memory_kib = kib;
        Ok(())
    }

    async fn domain_set_vcpus(&self, domain: &DomainHandle, count: u32, scope: SettingScope) -> Result<()> {
        let mut state = self.write();
        state.calls.vcpu_updates += 1;
        check(&state, "domain_set_vcpus")?;
        let d = state
            .domains
            .get_mut(domain.name())
            .ok_or_else(|| no_domain("domain_set_vcpus", domain.name()))?;
        debug!(count, ?scope, "Mock vCPU update");
        d.vcpus = count;
        Ok(())
    }
}
