//! Machine lifecycle controller.
//!
//! [`Driver`] manages one libvirt domain on behalf of the orchestrating tool:
//! it provisions the disk and the domain definition, drives the domain
//! through its power states and reports its address. The hypervisor is the
//! source of truth for the machine state; the driver only remembers the
//! domain handle once it has been looked up.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::address::AddressResolver;
use crate::config::{DriverConfig, DRIVER_NAME, DRIVER_VERSION};
use crate::error::{DriverError, Result};
use crate::image;
use crate::network::NetworkValidator;
use crate::poll::Poller;
use crate::storage::StorageManager;
use crate::traits::Hypervisor;
use crate::types::{DomainHandle, MachineState, SettingScope};
use crate::xml::{domain_xml, q35_machine_type};

/// Lifecycle controller of a single machine.
///
/// Operations take `&mut self`; concurrent calls on one machine are not
/// supported.
pub struct Driver {
    config: DriverConfig,
    backend: Arc<dyn Hypervisor>,
    /// Resolved on first use, never invalidated
    domain: Option<DomainHandle>,
}

impl Driver {
    /// Create a driver for the machine described by `config`.
    ///
    /// Nothing is looked up until the first operation.
    pub fn new(config: DriverConfig, backend: Arc<dyn Hypervisor>) -> Self {
        Self {
            config,
            backend,
            domain: None,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn storage(&self) -> StorageManager {
        StorageManager::new(self.backend.clone())
    }

    fn networks(&self) -> NetworkValidator {
        NetworkValidator::new(self.backend.clone())
    }

    fn resolver(&self) -> AddressResolver {
        AddressResolver::new(self.backend.clone(), &self.config.leases_dir)
    }

    /// The domain handle, looked up by machine name on first call.
    async fn domain(&mut self) -> Result<DomainHandle> {
        if let Some(domain) = &self.domain {
            return Ok(domain.clone());
        }

        debug!(machine = %self.config.machine_name, "Fetching VM");
        let domain = self
            .backend
            .lookup_domain(&self.config.machine_name)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to fetch machine");
                e
            })?
            .ok_or_else(|| DriverError::MachineNotFound(self.config.machine_name.clone()))?;

        self.domain = Some(domain.clone());
        Ok(domain)
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Check that the hypervisor is reachable and the network and storage
    /// pool are usable.
    #[instrument(skip(self), fields(machine = %self.config.machine_name))]
    pub async fn pre_create_check(&mut self) -> Result<()> {
        debug!("About to check libvirt version");
        let version = self.backend.lib_version().await.map_err(|e| {
            warn!(error = %e, "Unable to get libvirt version");
            e
        })?;
        debug!(version, "Libvirt version");

        self.networks()
            .validate(&self.config.network, self.config.network_definition.as_ref())
            .await?;
        self.storage()
            .ensure_pool(self.config.storage_pool_name(), &self.config.machine_dir())
            .await?;
        Ok(())
    }

    /// Machine type hint from the host capabilities.
    pub async fn detect_machine_type(&self) -> Result<Option<String>> {
        let caps = self.backend.capabilities_xml().await?;
        let machine_type = q35_machine_type(&caps)?;
        debug!(machine_type = ?machine_type, "Detected machine type");
        Ok(machine_type)
    }

    /// Provision the disk, define the domain and start it.
    #[instrument(skip(self), fields(machine = %self.config.machine_name))]
    pub async fn create(&mut self) -> Result<()> {
        if self.domain.is_some() {
            return Err(DriverError::InvalidState(format!(
                "machine '{}' is already defined",
                self.config.machine_name
            )));
        }
        self.config.validate()?;

        // Never lay a fresh disk over a machine that already exists
        if self.backend.lookup_domain(&self.config.machine_name).await?.is_some() {
            return Err(DriverError::InvalidState(format!(
                "machine '{}' is already defined",
                self.config.machine_name
            )));
        }

        self.setup_disk_image().await?;

        let machine_type = match self.detect_machine_type().await {
            Ok(machine_type) => machine_type,
            Err(e) => {
                debug!(error = %e, "Could not detect the machine type");
                None
            }
        };

        let xml = domain_xml(&self.config, machine_type.as_deref())?;
        debug!(xml = %xml, "Defining VM");
        let domain = self.backend.domain_define(&xml).await.map_err(|e| {
            warn!(error = %e, "Failed to create the VM");
            e
        })?;
        self.domain = Some(domain);

        image::write_marker(&self.config.machine_dir(), &self.config.machine_name).await;

        self.resize_disk(self.config.disk_capacity).await?;

        self.start().await
    }

    async fn setup_disk_image(&self) -> Result<()> {
        let machine_dir = self.config.machine_dir();
        let disk = self.config.disk_image_path();
        info!(disk = %disk.display(), "Preparing disk image for machine use");

        tokio::fs::create_dir_all(&machine_dir).await.map_err(|e| {
            DriverError::io(format!("failed to create {}", machine_dir.display()), e)
        })?;
        image::create_image(&self.config.image_source_path, &disk).await?;

        // The overlay was created behind libvirt's back
        self.storage()
            .refresh_pool(self.config.storage_pool_name(), &machine_dir)
            .await?;

        image::ensure_traversable(&machine_dir).await
    }

    async fn resize_disk(&self, capacity: u64) -> Result<bool> {
        self.storage()
            .resize_volume_if_needed(
                self.config.storage_pool_name(),
                &self.config.disk_image_filename(),
                capacity,
            )
            .await
    }

    // =========================================================================
    // Power state
    // =========================================================================

    /// Boot the domain and wait for it to get an address.
    ///
    /// Not finding an address is not an error: the IP is left empty.
    #[instrument(skip(self), fields(machine = %self.config.machine_name))]
    pub async fn start(&mut self) -> Result<()> {
        let domain = self.domain().await?;

        self.networks()
            .validate(&self.config.network, self.config.network_definition.as_ref())
            .await?;
        self.storage()
            .ensure_pool(self.config.storage_pool_name(), &self.config.machine_dir())
            .await?;

        if self.config.disk_capacity == 0 {
            let capacity = self
                .storage()
                .volume_capacity(self.config.storage_pool_name(), &self.config.disk_image_filename())
                .await?;
            self.config.disk_capacity = capacity;
        }

        info!("Starting VM");
        self.backend.domain_create(&domain).await.map_err(|e| {
            warn!(error = %e, "Failed to start");
            e
        })?;

        if self.config.network.is_empty() {
            return Ok(());
        }

        let this = &*self;
        let domain = &domain;
        let ip = Poller::IP_ADDRESS
            .until(move |attempt| async move {
                let ip = this.lookup_ip(domain).await?;
                if ip.is_empty() {
                    debug!(attempt, max = Poller::IP_ADDRESS.max_attempts, "Waiting for machine to come up");
                    return Ok::<_, DriverError>(None);
                }
                Ok(Some(ip))
            })
            .await?;

        match ip {
            Some(ip) => {
                info!(ip = %ip, "Found IP for machine");
                self.config.ip_address = ip;
            }
            None => {
                warn!("Unable to determine VM's IP address, did it fail to boot?");
                self.config.ip_address.clear();
            }
        }
        Ok(())
    }

    /// Ask the guest to power off and wait until it has.
    #[instrument(skip(self), fields(machine = %self.config.machine_name))]
    pub async fn stop(&mut self) -> Result<()> {
        let domain = self.domain().await?;

        if self.get_state().await? == MachineState::Stopped {
            return Ok(());
        }

        info!("Stopping VM");
        self.backend.domain_shutdown(&domain).await.map_err(|e| {
            warn!(error = %e, "Failed to gracefully shutdown VM");
            e
        })?;

        let backend = &self.backend;
        let domain = &domain;
        let stopped = Poller::SHUTDOWN
            .until(move |attempt| async move {
                // A failed query is just another "not yet"
                let state = backend.domain_state(domain).await.map(MachineState::from);
                debug!(attempt, state = ?state, "VM state");
                Ok::<_, DriverError>(matches!(state, Ok(MachineState::Stopped)).then_some(()))
            })
            .await?;

        stopped.ok_or(DriverError::ShutdownTimeout)
    }

    /// Power the domain off immediately.
    #[instrument(skip(self), fields(machine = %self.config.machine_name))]
    pub async fn kill(&mut self) -> Result<()> {
        let domain = self.domain().await?;
        info!("Killing VM");
        self.backend.domain_destroy(&domain).await
    }

    #[instrument(skip(self), fields(machine = %self.config.machine_name))]
    pub async fn restart(&mut self) -> Result<()> {
        info!("Restarting VM");
        self.stop().await?;
        self.start().await
    }

    /// Power off (best effort) and undefine the domain.
    ///
    /// The disk image and the storage pool are left alone.
    #[instrument(skip(self), fields(machine = %self.config.machine_name))]
    pub async fn remove(&mut self) -> Result<()> {
        let domain = self.domain().await?;
        info!("Removing VM");

        if let Err(e) = self.backend.domain_destroy(&domain).await {
            debug!(error = %e, "Ignoring destroy failure");
        }
        self.backend.domain_undefine(&domain).await
    }

    /// Current machine state as reported by the hypervisor.
    pub async fn get_state(&mut self) -> Result<MachineState> {
        let domain = self.domain().await?;
        let state = self.backend.domain_state(&domain).await?;
        debug!(state = ?state, "Current state");
        Ok(MachineState::from(state))
    }

    /// Current IPv4 address of the running machine; empty when unknown.
    #[instrument(skip(self), fields(machine = %self.config.machine_name))]
    pub async fn get_ip(&mut self) -> Result<String> {
        let domain = self.domain().await?;
        self.lookup_ip(&domain).await
    }

    async fn lookup_ip(&self, domain: &DomainHandle) -> Result<String> {
        let state = MachineState::from(self.backend.domain_state(domain).await?);
        if state != MachineState::Running {
            return Err(DriverError::NotRunning);
        }

        let ip = self
            .resolver()
            .resolve(domain, &self.config.network)
            .await?
            .unwrap_or_default();
        if !ip.is_empty() {
            debug!(ip = %ip, "IP address");
        }
        Ok(ip)
    }

    // =========================================================================
    // Configuration updates
    // =========================================================================

    /// Apply a new configuration given as the JSON form of [`DriverConfig`].
    ///
    /// Only memory, vCPU count and disk capacity are pushed to the
    /// hypervisor; everything else is adopted as is. If a step fails, the
    /// steps before it stay applied and are listed in the returned
    /// [`DriverError::PartialUpdate`].
    #[instrument(skip(self, raw), fields(machine = %self.config.machine_name))]
    pub async fn update_config_raw(&mut self, raw: &[u8]) -> Result<()> {
        let new: DriverConfig = serde_json::from_slice(raw)?;
        let mut applied = Vec::new();

        if new.memory_mib != self.config.memory_mib {
            debug!(memory_mib = new.memory_mib, "Updating memory size");
            self.set_memory(new.memory_mib)
                .await
                .map_err(|e| partial(&applied, "memory", e))?;
            applied.push("memory".to_string());
        }

        if new.cpus != self.config.cpus {
            debug!(cpus = new.cpus, "Updating vcpu count");
            self.set_vcpus(new.cpus)
                .await
                .map_err(|e| partial(&applied, "cpus", e))?;
            applied.push("cpus".to_string());
        }

        self.resize_disk(new.disk_capacity)
            .await
            .map_err(|e| partial(&applied, "disk_capacity", e))?;

        self.config = new;
        Ok(())
    }

    async fn set_memory(&mut self, memory_mib: u64) -> Result<()> {
        let domain = self.domain().await?;
        let kib = memory_mib.checked_mul(1024).ok_or_else(|| {
            DriverError::InvalidConfig(format!("memory size {} MiB is out of range", memory_mib))
        })?;
        self.backend.domain_set_memory(&domain, kib, SettingScope::Maximum).await?;
        self.backend.domain_set_memory(&domain, kib, SettingScope::Config).await?;
        self.config.memory_mib = memory_mib;
        Ok(())
    }

    async fn set_vcpus(&mut self, cpus: u32) -> Result<()> {
        let domain = self.domain().await?;
        self.backend.domain_set_vcpus(&domain, cpus, SettingScope::Maximum).await?;
        self.backend.domain_set_vcpus(&domain, cpus, SettingScope::Config).await?;
        self.config.cpus = cpus;
        Ok(())
    }

    // =========================================================================
    // Framework accessors
    // =========================================================================

    pub fn machine_name(&self) -> &str {
        &self.config.machine_name
    }

    /// SSH host: the machine's current address.
    pub async fn ssh_hostname(&mut self) -> Result<String> {
        self.get_ip().await
    }

    pub fn ssh_key_path(&self) -> &str {
        &self.config.ssh_key_path
    }

    pub fn ssh_port(&self) -> u16 {
        self.config.ssh_port()
    }

    pub fn ssh_username(&self) -> &str {
        self.config.ssh_user()
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn driver_version(&self) -> &'static str {
        DRIVER_VERSION
    }

    /// Docker-style URL of the machine; this driver has none.
    pub fn url(&self) -> String {
        String::new()
    }

    /// Path of `file` inside the machine's store directory.
    pub fn resolve_store_path(&self, file: &str) -> std::path::PathBuf {
        self.config.resolve_store_path(file)
    }
}

fn partial(applied: &[String], failed: &str, source: DriverError) -> DriverError {
    warn!(failed, error = %source, "Failed to update configuration");
    DriverError::PartialUpdate {
        applied: applied.to_vec(),
        failed: failed.to_string(),
        source: Box::new(source),
    }
}
