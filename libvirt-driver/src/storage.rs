//! Storage pool and volume management.
//!
//! The machine disk lives as a volume in a directory-backed pool. The pool is
//! created on demand; volumes only ever grow.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{DriverError, Result};
use crate::traits::Hypervisor;
use crate::types::{PoolHandle, VolumeHandle};
use crate::xml::dir_pool_xml;

/// Storage manager for the machine's pool and disk volume.
pub struct StorageManager {
    backend: Arc<dyn Hypervisor>,
}

impl StorageManager {
    pub fn new(backend: Arc<dyn Hypervisor>) -> Self {
        Self { backend }
    }

    /// Look up the pool, defining it over `target_dir` when absent and
    /// activating it when inactive.
    #[instrument(skip(self, target_dir), fields(pool = %name))]
    pub async fn ensure_pool(&self, name: &str, target_dir: &Path) -> Result<PoolHandle> {
        let pool = match self.backend.lookup_pool(name).await? {
            Some(pool) => pool,
            None => {
                debug!("Could not find storage pool, trying to create it");
                return self.create_pool(name, target_dir).await;
            }
        };

        // Corner case, but might happen...
        if !self.backend.pool_info(&pool).await?.active {
            self.activate_pool(&pool, target_dir).await?;
        }

        Ok(pool)
    }

    async fn create_pool(&self, name: &str, target_dir: &Path) -> Result<PoolHandle> {
        let xml = dir_pool_xml(name, &target_dir.to_string_lossy())?;
        info!(xml = %xml, "Creating storage pool");

        let pool = self.backend.pool_define(&xml).await.map_err(|e| {
            debug!(error = %e, "Could not create storage pool");
            DriverError::PrerequisiteMissing(format!(
                "Use 'crc setup' to define the storage pool, {}",
                e
            ))
        })?;

        self.activate_pool(&pool, target_dir).await?;
        Ok(pool)
    }

    async fn activate_pool(&self, pool: &PoolHandle, target_dir: &Path) -> Result<()> {
        debug!(pool = %pool.name(), "Activating pool");

        tokio::fs::create_dir_all(target_dir).await.map_err(|e| {
            DriverError::io(format!("failed to create {}", target_dir.display()), e)
        })?;

        self.backend.pool_create(pool).await.map_err(|e| {
            warn!(error = %e, "Failed to start storage pool");
            e
        })
    }

    /// Re-scan the pool so volumes created outside libvirt become visible.
    #[instrument(skip(self, target_dir), fields(pool = %name))]
    pub async fn refresh_pool(&self, name: &str, target_dir: &Path) -> Result<()> {
        let pool = self.ensure_pool(name, target_dir).await?;
        self.backend.pool_refresh(&pool).await
    }

    async fn volume(&self, pool_name: &str, volume_name: &str) -> Result<VolumeHandle> {
        let pool = self
            .backend
            .lookup_pool(pool_name)
            .await?
            .ok_or_else(|| DriverError::PrerequisiteMissing(format!(
                "Use 'crc setup' to define the machine driver storage pool, pool '{}' not found",
                pool_name
            )))?;

        self.backend
            .lookup_volume(&pool, volume_name)
            .await?
            .ok_or_else(|| DriverError::backend(
                "lookup volume",
                format!("volume '{}' not found in pool '{}'", volume_name, pool_name),
            ))
    }

    /// Logical capacity of a volume in bytes.
    #[instrument(skip(self), fields(pool = %pool_name, volume = %volume_name))]
    pub async fn volume_capacity(&self, pool_name: &str, volume_name: &str) -> Result<u64> {
        let volume = self.volume(pool_name, volume_name).await?;
        let info = self.backend.volume_info(&volume).await?;
        debug!(capacity = info.capacity_bytes, "Volume capacity");
        Ok(info.capacity_bytes)
    }

    /// Grow a volume to `requested` bytes.
    ///
    /// Returns `Ok(false)` when nothing had to be done: `requested` is 0
    /// (unset) or already the current capacity. Shrinking is refused.
    #[instrument(skip(self), fields(pool = %pool_name, volume = %volume_name))]
    pub async fn resize_volume_if_needed(
        &self,
        pool_name: &str,
        volume_name: &str,
        requested: u64,
    ) -> Result<bool> {
        if requested == 0 {
            return Ok(false);
        }

        let volume = self.volume(pool_name, volume_name).await?;
        let current = self.backend.volume_info(&volume).await?.capacity_bytes;

        if requested == current {
            return Ok(false);
        }
        if requested < current {
            return Err(DriverError::ShrinkRefused { current, requested });
        }

        info!(current, requested, "Resizing disk image");
        self.backend.volume_resize(&volume, requested).await?;
        Ok(true)
    }
}
